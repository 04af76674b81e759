//! Turnstile - In-Process Admission Control
//!
//! This crate decides, per incoming request, whether to admit, delay or reject
//! it. It provides three limiters that share one admission interface:
//! interval pacing, a fixed-window counter, and a per-key registry of
//! fixed-window counters with idle eviction. A small HTTP front end puts each
//! of them in front of a route.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
