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

//! Control socket
//!
//! A UNIX-domain socket speaking line commands, running on its own thread
//! with plain blocking I/O; nothing here touches the data plane except
//! through atomics. Each command gets one response terminated by a blank
//! line.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::HealthState;
use crate::runtime::Shared;
use crate::stats;

pub fn spawn(path: PathBuf, ctx: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    // A stale socket file from a previous run would fail the bind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;
    info!(path = %path.display(), "control socket listening");

    std::thread::Builder::new()
        .name("admin".to_string())
        .spawn(move || accept_loop(listener, ctx))
}

fn accept_loop(listener: UnixListener, ctx: Arc<Shared>) {
    while ctx.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = serve_client(stream, &ctx) {
                    debug!(error = %e, "control client error");
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!(error = %e, "control socket accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_client(stream: UnixStream, ctx: &Shared) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line?;
        let command = line.trim();
        if command.is_empty() || command == "quit" {
            break;
        }
        let response = handle_command(command, ctx);
        writer.write_all(response.as_bytes())?;
        if !response.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Executes one line command and returns the response body.
pub(crate) fn handle_command(command: &str, ctx: &Shared) -> String {
    let words: Vec<&str> = command.split_whitespace().collect();

    match words.as_slice() {
        ["show", "info"] => show_info(ctx),
        ["show", "stat"] => {
            let registry = ctx.registry.load();
            stats::render_csv(&stats::snapshot(&registry, &ctx.stats))
        }
        ["show", "stat", "json"] => {
            let registry = ctx.registry.load();
            serde_json::to_string_pretty(&stats::snapshot(&registry, &ctx.stats))
                .unwrap_or_else(|e| format!("cannot encode: {e}"))
        }
        ["disable", "server", target] => {
            with_server(ctx, target, |b| {
                b.set_state(HealthState::Maintenance);
                format!("{target} disabled")
            })
        }
        ["enable", "server", target] => {
            with_server(ctx, target, |b| {
                b.set_state(HealthState::Up);
                format!("{target} enabled")
            })
        }
        ["set", "weight", target, raw] => match raw.parse::<u32>() {
            Ok(weight) if weight > 0 => with_server(ctx, target, |b| {
                b.set_weight(weight);
                format!("{target} weight set to {weight}")
            }),
            _ => format!("invalid weight '{raw}'"),
        },
        ["shutdown", "sessions", "server", target] => {
            with_server(ctx, target, |b| {
                b.kill_epoch.fetch_add(1, Ordering::Relaxed);
                format!("shutting down sessions on {target}")
            })
        }
        ["help"] => HELP.to_string(),
        _ => "Unknown command. Try 'help'.".to_string(),
    }
}

const HELP: &str = "show info\n\
show stat [json]\n\
disable server POOL/NAME\n\
enable server POOL/NAME\n\
set weight POOL/NAME VALUE\n\
shutdown sessions server POOL/NAME\n\
quit";

fn show_info(ctx: &Shared) -> String {
    let registry = ctx.registry.load();
    format!(
        "Name: ultrabalancer\n\
Version: {}\n\
Uptime_sec: {}\n\
Nbthread: {}\n\
Maxconn: {}\n\
CurrConns: {}\n\
CumConns: {}\n\
RejectedConns: {}\n\
BytesIn: {}\n\
BytesOut: {}\n\
Pools: {}",
        env!("CARGO_PKG_VERSION"),
        ctx.stats.uptime_secs(),
        ctx.cfg.workers,
        ctx.cfg.maxconn,
        ctx.stats.active_conns.load(Ordering::Relaxed),
        ctx.stats.total_conns.load(Ordering::Relaxed),
        ctx.stats.rejected_conns.load(Ordering::Relaxed),
        ctx.stats.bytes_in.load(Ordering::Relaxed),
        ctx.stats.bytes_out.load(Ordering::Relaxed),
        registry.pools.len(),
    )
}

/// Resolves `POOL/NAME` and applies the action to the backend.
fn with_server<F>(ctx: &Shared, target: &str, action: F) -> String
where
    F: FnOnce(&crate::backend::Backend) -> String,
{
    let Some((pool_name, server_name)) = target.split_once('/') else {
        return format!("expected POOL/NAME, got '{target}'");
    };

    let registry = ctx.registry.load();
    let Some(pool) = registry.pool_by_name(pool_name) else {
        return format!("no such pool '{pool_name}'");
    };
    let Some(backend) = pool.backend_by_name(server_name) else {
        return format!("no such server '{server_name}' in pool '{pool_name}'");
    };

    action(backend)
}
