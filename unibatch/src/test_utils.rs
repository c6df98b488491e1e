//! 测试工具

mod broker;
mod handler;

pub use broker::{FakeBroker, FakeClient};
pub use handler::{Call, RecordingHandler};
