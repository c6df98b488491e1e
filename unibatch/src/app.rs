//! # 消费者上下文
//!
//! 每个消费者配置对应一个拉取循环，彼此独立并发运行，仅通过代理共享状态。

use crate::{
    domain::{BrokerClient, Handler},
    poller::{LoopState, PollLoop},
};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, Notify, OnceCell, watch};
use tracing::{error, info};

static APP: OnceCell<Arc<App>> = OnceCell::const_new();
/// 进程级消费者上下文，收到 Ctrl-C 后优雅关闭
pub async fn context() -> Arc<App> {
    Arc::clone(
        APP.get_or_init(|| async {
            let app = Arc::new(App::new());
            let app_clone = Arc::clone(&app);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(_) => info!("收到 Ctrl-C 信号"),
                    Err(e) => {
                        error!("监听 Ctrl-C 信号失败: {e}");
                        info!("启用备用关闭机制");
                    }
                }
                app_clone.shutdown().await;
            });
            app
        })
        .await,
    )
}

/// 消费者上下文结构
pub struct App {
    initiated: AtomicBool,
    tasks: Mutex<tokio::task::JoinSet<()>>,
    notify: Arc<Notify>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// 构造函数
    pub fn new() -> Self {
        Self {
            initiated: AtomicBool::new(false),
            tasks: Mutex::new(tokio::task::JoinSet::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 启用后台任务，待任务就绪后返回
    pub async fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<Notify>, Arc<Notify>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        let notify = Arc::clone(&self.notify);
        let ready = Arc::new(Notify::new());
        let waiter = Arc::clone(&ready);
        tasks.spawn(task(ready, notify));
        waiter.notified().await;
    }

    /// 启动拉取循环，返回其状态订阅
    pub async fn launch<B, H>(&self, poll_loop: PollLoop<B, H>) -> watch::Receiver<LoopState>
    where
        B: BrokerClient,
        H: Handler,
    {
        let state = poll_loop.subscribe();
        info!("启动消费者 {}", poll_loop.name());
        self.spawn(move |ready, notify| poll_loop.run(ready, notify))
            .await;
        state
    }

    /// 是否已开始关闭
    pub fn is_shutdown(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// 优雅关闭，等待所有拉取循环完成在途批次
    pub async fn shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("开始优雅退出");
            self.notify.notify_waiters();
            let mut tasks = self.tasks.lock().await;
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("后台任务发生错误：{e}");
                }
            }
            info!("优雅退出所有后台任务");
        }
    }
}
