//! Cross-module unit tests: rendering, diff classification, dispatcher
//! semantics, rolling-update ordering and the SQL sync plans.

#[path = "../common/mod.rs"]
mod common;

mod dispatch;
mod rendering;
mod rolling;
mod sql;
