// KTOONSERVATIVE LIBRARY
// PURE DECISION LOGIC (SAMPLER, ENGINE, BOOST, SCREEN, TUNING) PLUS THE
// PLATFORM GLUE THE DAEMON AND THE INTEGRATION TESTS SHARE.

#[macro_use]
pub mod log;

pub mod boost;
pub mod control;
pub mod engine;
pub mod event;
pub mod governor;
pub mod platform;
pub mod sampler;
pub mod scheduler;
pub mod screen;
pub mod tuning;
