// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

pub mod backoff;
pub mod work_queue;

pub use backoff::ExponentialBackoff;
pub use work_queue::{QueueItem, WorkQueue};
