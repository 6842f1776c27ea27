// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 路由表模块
//!
//! 路由表是按注册顺序排列的路由序列，顺序即优先级：分发时取第一个匹配项。
//!
//! 注册在互斥锁内完成“复制、追加、替换”，分发则无锁地读取 `ArcSwap` 中的快照，
//! 因此服务运行期间继续注册也是安全的：进行中的请求要么看到旧表，要么看到新表。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::debug;

use crate::{
    exception::Exception, param::HttpRequestMethod, pattern::PathPattern, request::Request,
    response::Response,
};

/// 可跨线程发送的装箱 Future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// handler 的返回值。写出失败等错误由分发器记录，不会回传给客户端。
pub type HandlerResult = Result<(), Exception>;

/// 路由处理函数：接收请求上下文与响应上下文，异步地完成响应。
pub type Handler =
    Box<dyn for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

/// 路由接受的方法：某个具体方法，或任意方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFilter {
    Exact(HttpRequestMethod),
    Any,
}

impl MethodFilter {
    pub fn accepts(&self, method: HttpRequestMethod) -> bool {
        match self {
            MethodFilter::Exact(m) => *m == method,
            MethodFilter::Any => true,
        }
    }
}

impl fmt::Display for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodFilter::Exact(m) => write!(f, "{}", m),
            MethodFilter::Any => f.write_str("ANY"),
        }
    }
}

/// 一条已注册的路由，构造后不可变
pub struct Route {
    method: MethodFilter,
    pattern: PathPattern,
    handler: Handler,
}

impl Route {
    pub fn new(method: MethodFilter, pattern: &str, handler: Handler) -> Result<Self, Exception> {
        Ok(Self {
            method,
            pattern: PathPattern::compile(pattern)?,
            handler,
        })
    }

    pub fn method(&self) -> MethodFilter {
        self.method
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern.source())
            .field("param_names", &self.pattern.param_names())
            .finish()
    }
}

/// 路由表的不可变快照
pub type RouteSnapshot = Arc<Vec<Arc<Route>>>;

#[derive(Debug)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<Route>>>,
    write_lock: Mutex<()>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// 编译模式并将路由追加到表尾。编译失败时路由表保持不变。
    pub fn register(
        &self,
        method: MethodFilter,
        pattern: &str,
        handler: Handler,
    ) -> Result<(), Exception> {
        let route = Arc::new(Route::new(method, pattern, handler)?);

        // 锁只用于串行化注册方，读侧不持锁
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = self.routes.load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(route);
        self.routes.store(Arc::new(next));

        debug!("注册路由 {} {}", method, pattern);
        Ok(())
    }

    /// 当前路由表的一致快照
    pub fn snapshot(&self) -> RouteSnapshot {
        self.routes.load_full()
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 将闭包装箱为 [`Handler`]
pub fn boxed<F>(handler: F) -> Handler
where
    F: for<'a> Fn(Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    Box::new(handler)
}
