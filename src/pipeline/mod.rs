pub mod autofocus;
pub mod cancel;
pub mod clock;
pub mod handoff;
pub mod lapse;
pub mod scheduler;

pub use autofocus::{AutofocusPrescan, PrescanState};
pub use cancel::{CancelHandle, CancellationSource, ControlEvent};
pub use clock::{Clock, SystemClock};
pub use handoff::EncodeHandoff;
pub use lapse::LapseApp;
pub use scheduler::{CaptureScheduler, RunOutcome, RunSummary, ScheduleState};
