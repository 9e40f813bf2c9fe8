// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod engine;
pub mod pattern;
pub mod position;
pub mod publisher;
pub mod reaper;
pub mod tailer;
pub mod watcher;
