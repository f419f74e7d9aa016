pub mod controller;
pub mod observer;
pub mod relay;
pub mod scheduler;
pub mod signal;
pub mod traits;

pub use controller::{ControlError, SessionController};
pub use observer::{Observation, Observer, Transcript};
pub use relay::MessageRelay;
pub use scheduler::{PollingScheduler, WakeUp};
pub use signal::StopSignal;
