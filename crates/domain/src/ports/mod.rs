//! 外部协作方接口
//!
//! 核心只消费这些接口，具体实现（渲染与投递、分群条件求值、告警通道）由宿主提供。

pub mod broadcast;
pub mod notification;
pub mod segments;

pub use broadcast::*;
pub use notification::*;
pub use segments::*;
