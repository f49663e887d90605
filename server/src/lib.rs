// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! Three interchangeable server shells over one connection state machine:
//! `st-nonblocking`, `mt-nonblocking`, and `st-coroutine` differ only in
//! how they schedule [`connection::ConnectionCore`] against readiness
//! events; the byte-pumping logic itself lives once in [`connection`].
//!
//! ## Examples
//!
//! The three runnable binaries in `src/bin/` wire this crate's pieces
//! together with [`config::Config`] and a [`storage::MemoryStorage`].

/// The growable scratch buffer connections use for their read side.
pub mod buffer;
/// Shared CLI configuration for the three server binaries.
pub mod config;
/// The per-connection I/O state machine and its three dispatch flavors.
pub mod connection;
