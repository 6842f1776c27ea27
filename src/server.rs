// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 服务器生命周期模块
//!
//! `Server` 持有路由表与配置，负责监听端口、接受连接，并在停机时等待进行中的请求完成。
//!
//! 状态迁移：`Unbound → Listening → ShuttingDown → Stopped`。

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::{
    net::TcpListener,
    sync::{watch, Notify},
};

use crate::{
    config::Config,
    connection::handle_connection,
    dispatcher::Dispatcher,
    exception::Exception,
    param::HttpRequestMethod,
    request::Request,
    response::Response,
    route::{boxed, BoxFuture, HandlerResult, MethodFilter, RouteTable},
};

/// 服务器所处的生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unbound,
    Listening,
    ShuttingDown,
    Stopped,
}

/// 进行中请求的计数器，计数归零时唤醒等待方
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// 等待计数归零
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // 先登记再检查计数，避免错过检查与等待之间的唤醒
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 释放时计数减一
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    routes: Arc<RouteTable>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            routes: Arc::new(RouteTable::new()),
            state: Mutex::new(ServerState::Unbound),
            local_addr: Mutex::new(None),
            shutdown,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 注册一条路由，运行期间注册同样生效
    pub fn register<F>(&self, method: MethodFilter, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.routes.register(method, pattern, boxed(handler))
    }

    pub fn get<F>(&self, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(MethodFilter::Exact(HttpRequestMethod::Get), pattern, handler)
    }

    pub fn post<F>(&self, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(MethodFilter::Exact(HttpRequestMethod::Post), pattern, handler)
    }

    pub fn put<F>(&self, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(MethodFilter::Exact(HttpRequestMethod::Put), pattern, handler)
    }

    pub fn delete<F>(&self, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(MethodFilter::Exact(HttpRequestMethod::Delete), pattern, handler)
    }

    /// 匹配任意方法
    pub fn any<F>(&self, pattern: &str, handler: F) -> Result<(), Exception>
    where
        F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(MethodFilter::Any, pattern, handler)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    /// 处于监听状态时返回实际绑定的地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let addr = match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        match self.state() {
            ServerState::Listening => addr,
            _ => None,
        }
    }

    /// 当前进行中的请求数
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// 绑定端口并开始服务，直到停机
    pub async fn listen(&self, port: u16) -> Result<(), Exception> {
        let address = match self.config.local() {
            true => Ipv4Addr::LOCALHOST,
            false => Ipv4Addr::UNSPECIFIED,
        };
        let socket = SocketAddrV4::new(address, port);
        info!("服务端将在{}上监听Socket连接", socket);

        let listener = TcpListener::bind(socket).await.map_err(|source| {
            error!("无法绑定端口：{}，错误：{}", port, source);
            Exception::Bind {
                addr: socket.to_string(),
                source,
            }
        })?;
        info!("端口{}绑定完成", port);
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务。优雅停机后返回 `Ok(())`。
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Exception> {
        {
            let mut state = self.lock_state();
            if *state != ServerState::Unbound {
                return Err(Exception::AlreadyStarted);
            }
            *state = ServerState::Listening;
        }
        match listener.local_addr() {
            Ok(addr) => {
                self.set_local_addr(Some(addr));
                info!("服务端开始在{}上接受连接", addr);
            }
            Err(e) => warn!("无法获取监听地址: {}", e),
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.routes)));
        let mut stop = self.shutdown.subscribe();
        let mut id: u128 = 0;

        let result = loop {
            tokio::select! {
                _ = stop.wait_for(|stop| *stop) => {
                    info!("主循环接收到停机指令，停止接受新连接");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("[ID{}]TCP连接已建立：{}", id, addr);
                        // 在派发任务之前计数，停机时不会漏掉刚接受的连接
                        let guard = self.in_flight.enter();
                        tokio::spawn(handle_connection(
                            stream,
                            id,
                            Arc::clone(&dispatcher),
                            Arc::clone(&self.config),
                            self.shutdown.subscribe(),
                            guard,
                        ));
                        id += 1;
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("接受连接失败，已忽略: {}", e);
                    }
                    Err(e) => {
                        error!("接受连接时遇到致命错误: {}", e);
                        break Err(Exception::Io(e));
                    }
                }
            }
        };

        drop(listener);
        self.set_local_addr(None);
        if result.is_err() {
            *self.lock_state() = ServerState::Stopped;
        }
        result
    }

    /// 停止接受新连接，并在 `timeout` 内等待进行中的请求完成
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Exception> {
        {
            let mut state = self.lock_state();
            match *state {
                ServerState::Unbound | ServerState::Stopped => {
                    *state = ServerState::Stopped;
                    self.shutdown.send_replace(true);
                    return Ok(());
                }
                ServerState::Listening | ServerState::ShuttingDown => {
                    *state = ServerState::ShuttingDown;
                }
            }
        }

        info!("开始优雅停机，最长等待{}秒", timeout.as_secs_f64());
        self.shutdown.send_replace(true);

        let waited = tokio::time::timeout(timeout, self.in_flight.wait_idle()).await;
        *self.lock_state() = ServerState::Stopped;
        match waited {
            Ok(()) => {
                info!("所有请求处理完毕，服务器已停止");
                Ok(())
            }
            Err(_) => {
                let in_flight = self.in_flight.count();
                warn!("停机超时，仍有{}个请求未完成", in_flight);
                Err(Exception::ShutdownTimeout { in_flight })
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        match self.local_addr.lock() {
            Ok(mut guard) => *guard = addr,
            Err(poisoned) => *poisoned.into_inner() = addr,
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个连接层面的错误，不影响监听器本身
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(server: Arc<Server>) -> (SocketAddr, tokio::task::JoinHandle<Result<(), Exception>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.serve(listener).await });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_in_flight_counter() {
        let in_flight = Arc::new(InFlight::default());
        in_flight.wait_idle().await;

        let first = in_flight.enter();
        let second = in_flight.enter();
        assert_eq!(in_flight.count(), 2);
        drop(first);
        assert_eq!(in_flight.count(), 1);

        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move { in_flight.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unbound_server() {
        let server = Server::new();
        assert_eq!(server.state(), ServerState::Unbound);
        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(Exception::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let server = Arc::new(Server::new());
        server
            .get("/ping", |_req, res| {
                Box::pin(async move {
                    res.text("pong").await?;
                    Ok(())
                })
            })
            .unwrap();
        let (addr, handle) = start(Arc::clone(&server)).await;
        while server.local_addr().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), ServerState::Listening);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut wire = String::new();
        stream.read_to_string(&mut wire).await.unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.ends_with("pong"));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_serve_twice() {
        let server = Arc::new(Server::new());
        let (_, handle) = start(Arc::clone(&server)).await;
        while server.state() != ServerState::Listening {
            tokio::task::yield_now().await;
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(Exception::AlreadyStarted)));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_listen_bind_failure() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let server = Server::with_config(Config::from_toml_str("local = true").unwrap());
        let result = server.listen(port).await;
        assert!(matches!(result, Err(Exception::Bind { .. })));
        assert_eq!(server.state(), ServerState::Unbound);
    }

    #[test]
    fn test_registration_sugar() {
        let server = Server::new();
        server.get("/a", |_req, _res| Box::pin(async { Ok(()) })).unwrap();
        server.post("/a", |_req, _res| Box::pin(async { Ok(()) })).unwrap();
        server.put("/a/{id}", |_req, _res| Box::pin(async { Ok(()) })).unwrap();
        server.delete("/a/{id}", |_req, _res| Box::pin(async { Ok(()) })).unwrap();
        server.any("/b", |_req, _res| Box::pin(async { Ok(()) })).unwrap();
        assert_eq!(server.route_count(), 5);
        assert!(server.get("/bad/{", |_req, _res| Box::pin(async { Ok(()) })).is_err());
        assert_eq!(server.route_count(), 5);
    }
}
