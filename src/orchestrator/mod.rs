//! Recurring execution of regression schedules.
//!
//! [`scheduler`] owns the timers, [`job`] is what a timer runs, [`post_process`]
//! decides whether a finished run warrants an alert, and [`controller`] wires them
//! into the long-running daemon.

pub mod controller;
pub mod job;
pub mod post_process;
pub mod scheduler;

pub use controller::run_daemon;
pub use job::ScheduleRunner;
pub use scheduler::Scheduler;
