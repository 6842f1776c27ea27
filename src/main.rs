// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # webrouter 示例服务
//!
//! 启动流程：
//! - 初始化 log4rs 日志（配置文件缺失时退回到控制台输出）
//! - 读取 TOML 配置并按配置构建多线程 Tokio 运行时
//! - 注册示例路由并在后台任务中开始监听
//! - 等待 SIGINT / SIGTERM 或控制台 `stop` 指令，随后在宽限期内优雅停机

use std::{io, process, sync::Arc};

use log::{debug, error, info, warn, LevelFilter};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
    sync::mpsc,
};

use webrouter::{app, Config, Exception, Server};

const LOG_CONFIG: &str = "config/log4rs.yaml";
const CONFIG_FILE: &str = "config/development.toml";

fn main() {
    init_logging();

    let config = match Config::from_toml(CONFIG_FILE) {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            warn!("无法载入配置文件{}：{}，使用默认配置", CONFIG_FILE, e);
            Config::default()
        }
    };

    let worker_threads = config.worker_threads();
    let runtime = match Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时: {}", e);
            process::exit(1);
        }
    };
    info!("异步运行时已启动，工作线程数：{}", worker_threads);

    let result = runtime.block_on(run(config));
    // 控制台任务可能仍阻塞在标准输入上，不等待它
    runtime.shutdown_background();

    if let Err(e) = result {
        error!("服务器异常退出: {}", e);
        process::exit(1);
    }
}

/// 优先使用 YAML 配置，失败时退回到 info 级别的控制台日志
fn init_logging() {
    match log4rs::init_file(LOG_CONFIG, Default::default()) {
        Ok(()) => return,
        Err(e) => eprintln!("无法载入日志配置{}：{}，使用控制台日志", LOG_CONFIG, e),
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
        )))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));
    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("日志系统初始化失败: {}", e);
            }
        }
        Err(e) => eprintln!("日志配置无效: {}", e),
    }
}

async fn run(config: Config) -> Result<(), Exception> {
    let port = config.port();
    let grace = config.shutdown_timeout();
    let stream_delay = config.stream_delay();

    let server = Arc::new(Server::with_config(config));
    if let Err(e) = app::routes(&server, stream_delay) {
        error!("注册路由失败: {}", e);
        return Err(e);
    }
    info!("已注册{}条路由", server.route_count());

    let mut listening = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.listen(port).await }
    });

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    tokio::spawn(console(Arc::clone(&server), stop_tx));

    tokio::select! {
        _ = wait_for_signal() => info!("收到停机信号"),
        Some(()) = stop_rx.recv() => info!("收到控制台停机指令"),
        joined = &mut listening => {
            // 未收到停机请求时监听任务就已结束，只可能是出错
            return match joined {
                Ok(result) => result,
                Err(e) => Err(Exception::Io(io::Error::new(io::ErrorKind::Other, e))),
            };
        }
    }

    let result = server.shutdown(grace).await;
    match &result {
        Ok(()) => info!("服务器已优雅停止"),
        Err(e) => error!("服务器停机失败: {}", e),
    }
    match listening.await {
        Ok(Err(e)) => error!("监听任务异常结束: {}", e),
        Err(e) => error!("监听任务异常结束: {}", e),
        Ok(Ok(())) => {}
    }
    result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听 Ctrl-C 信号: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("无法监听 SIGTERM 信号: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// 交互式管理控制台，标准输入关闭时退出
async fn console(server: Arc<Server>, stop: mpsc::Sender<()>) {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) => {
                debug!("标准输入已关闭，控制台退出");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("读取控制台输入失败: {}", e);
                break;
            }
        }
        match input.trim() {
            "stop" => {
                println!("停机指令已激活，服务器将在处理完进行中的请求后关闭...");
                let _ = stop.send(()).await;
                break;
            }
            "help" => {
                println!("== webrouter Help ==");
                println!("stop   - 发出停机信号");
                println!("status - 查看当前服务器运行状态");
                println!("help   - 显示此帮助信息");
                println!("====================");
            }
            "status" => {
                println!("== webrouter 状态 ===");
                println!("运行状态: {:?}", server.state());
                println!("进行中的请求数: {}", server.in_flight());
                println!("已注册路由数: {}", server.route_count());
                println!("====================");
            }
            "" => {}
            cmd => println!("无效的命令：{}", cmd),
        }
    }
}
