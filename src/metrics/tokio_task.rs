// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Task spawning helpers that propagate the telemetry context.

use foundations::telemetry::TelemetryContext;
use std::future::Future;
use task_killswitch::spawn_with_killswitch as killswitch_spawn;
use tokio::task::JoinHandle;

/// Spawns a task that inherits the caller's telemetry context.
///
/// The `name` is currently only used for debugging but keeps call sites
/// self-describing.
pub(crate) fn spawn<T>(_name: &str, future: T) -> JoinHandle<T::Output>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    let ctx = TelemetryContext::current();
    tokio::spawn(ctx.apply(future))
}

/// Spawns a long-lived task that inherits the caller's telemetry context and
/// integrates with [task-killswitch](task_killswitch) for process shutdown.
pub(crate) fn spawn_with_killswitch<T>(_name: &str, future: T)
where
    T: Future<Output = ()> + Send + 'static,
{
    let ctx = TelemetryContext::current();
    killswitch_spawn(ctx.apply(future))
}
