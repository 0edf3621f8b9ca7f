//! Rust有栈协程运行时Demo
//!
//! N:M调度：N个协程跑在M个线程上，和操作系统的调度器十分类似。
//! - 操作系统调度`Process` <=> 运行时调度`Coroutine`
//! - `Process`有`Ready`/`Running`/`Waiting`状态 <=> `Coroutine`有`Ready`/`Exec`/`Hold`状态
//!   - 所有worker线程共享一个就绪队列（[`Scheduler`]），没有任务时运行各自的idle协程
//!   - 等待IO的协程挂在[`IoManager`]的文件描述符表上，由epoll唤醒
//! - 和async运行时不同，协程有自己的栈，阻塞点直接切换上下文，不需要`Future`
//!   - [`hook`]模块把会阻塞的socket调用和`sleep`变成"注册事件 + 让出"
//!
//! ```no_run
//! use mini_coroutine_runtime::{hook, IoManager};
//!
//! let iom = IoManager::new(2, false, "demo").unwrap();
//! iom.schedule(|| {
//!     hook::usleep(10_000);
//!     println!("woke up on {:?}", std::thread::current().name());
//! });
//! iom.stop();
//! ```

pub mod config;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod hook;
pub mod reactor;
pub mod timer;

pub use coroutine::{Coroutine, State, Wake};
pub use error::{Error, Result};
pub use executor::{Driver, Scheduler, Task};
pub use reactor::{Event, IoManager};
pub use timer::{Timer, TimerManager};
