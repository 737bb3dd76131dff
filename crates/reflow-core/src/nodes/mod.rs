pub mod events;
pub mod observer;
pub mod signal;

pub use events::{EventSource, Events};
pub use observer::{Observer, ObserverAction, ObserverCtx};
pub use signal::{Signal, VarSignal};
