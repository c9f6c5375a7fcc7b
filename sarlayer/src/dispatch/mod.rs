//! Request dispatch.
//!
//! - [`request`]: processing requests and their discovery from chip/label directories
//! - [`slots`]: the fixed pool of execution slots (FIFO ticket locks)
//! - [`summary`]: per-request outcomes and the running batch summary
//! - [`dispatcher`]: the scheduler tying matcher, collaborators and registry together

mod dispatcher;
pub mod request;
pub mod slots;
pub mod summary;

pub use dispatcher::{DispatchError, Dispatcher, CANCELLED_REASON};
pub use request::{discover_requests, load_request, InputError, ProcessingRequest};
pub use slots::{SlotGuard, SlotPool, SlotTicket};
pub use summary::{BatchReport, JobRecord, Outcome, SummaryWriter};
