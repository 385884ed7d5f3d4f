//! Built-in commands
//!
//! Compositor commands run the blocking facade call on tokio's blocking
//! pool. When the facade has nothing to return (disconnected, or the
//! compositor refused), the reply carries `"data": null` together with the
//! current connection flag so clients can retry later.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use serde_json::{json, Value};

use crate::compositor::CompositorFacade;
use crate::context::BridgeContext;

fn ok_reply(command: &str, data: Value) -> Value {
    json!({ "status": "ok", "command": command, "data": data })
}

fn facade_reply(command: &str, facade: &CompositorFacade, data: Option<Value>) -> Value {
    match data {
        Some(data) => ok_reply(command, data),
        None => json!({
            "status": "ok",
            "command": command,
            "data": null,
            "connected": facade.is_connected(),
        }),
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("compositor request task failed")
}

/// Argument `index` as an id; accepts numbers and numeric strings
fn id_arg(args: &[Value], index: usize, what: &str) -> anyhow::Result<u64> {
    let arg = args
        .get(index)
        .ok_or_else(|| anyhow!("missing {} argument", what))?;

    match arg {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("invalid {}: {}", what, arg))
}

fn view_id_arg(args: &[Value]) -> anyhow::Result<u64> {
    id_arg(args, 0, "view id")
}

/// Argument `index` as a flag; accepts booleans, 0/1 and their string forms
fn bool_arg(args: &[Value], index: usize, what: &str) -> anyhow::Result<bool> {
    let arg = args
        .get(index)
        .ok_or_else(|| anyhow!("missing {} argument", what))?;

    match arg {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
    .ok_or_else(|| anyhow!("invalid {}: {}", what, arg))
}

fn coordinate_arg(args: &[Value], index: usize, what: &str) -> anyhow::Result<u32> {
    let value = id_arg(args, index, what)?;
    u32::try_from(value).map_err(|_| anyhow!("invalid {}: {}", what, value))
}

/// Register a facade query taking no arguments
fn register_query<T, F>(ctx: &BridgeContext, name: &'static str, query: F)
where
    F: Fn(&CompositorFacade) -> Option<T> + Send + Sync + Copy + 'static,
    T: serde::Serialize + Send + 'static,
{
    let facade = ctx.facade.clone();
    ctx.register_command(name, move |_args| {
        let facade = facade.clone();
        async move {
            let worker = facade.clone();
            let data = blocking(move || query(&worker)).await?;
            let data = data.map(serde_json::to_value).transpose()?;
            Ok(facade_reply(name, &facade, data))
        }
    });
}

/// Register a facade query taking an id, described as `what` in errors
fn register_id_query<T, F>(ctx: &BridgeContext, name: &'static str, what: &'static str, query: F)
where
    F: Fn(&CompositorFacade, u64) -> Option<T> + Send + Sync + Copy + 'static,
    T: serde::Serialize + Send + 'static,
{
    let facade = ctx.facade.clone();
    ctx.register_command(name, move |args: Vec<Value>| {
        let facade = facade.clone();
        async move {
            let id = id_arg(&args, 0, what)?;
            let worker = facade.clone();
            let data = blocking(move || query(&worker, id)).await?;
            let data = data.map(serde_json::to_value).transpose()?;
            Ok(facade_reply(name, &facade, data))
        }
    });
}

/// Register a view action; the reply data is whether the compositor accepted it
fn register_view_action<F>(ctx: &BridgeContext, name: &'static str, action: F)
where
    F: Fn(&CompositorFacade, u64) -> bool + Send + Sync + Copy + 'static,
{
    let facade = ctx.facade.clone();
    ctx.register_command(name, move |args: Vec<Value>| {
        let facade = facade.clone();
        async move {
            let id = view_id_arg(&args)?;
            let worker = facade.clone();
            let accepted = blocking(move || action(&worker, id)).await?;
            Ok(action_reply(name, &facade, accepted))
        }
    });
}

fn action_reply(command: &str, facade: &CompositorFacade, accepted: bool) -> Value {
    json!({
        "status": "ok",
        "command": command,
        "data": accepted,
        "connected": facade.is_connected(),
    })
}

/// Register a view action that sets a view state on or off
fn register_view_toggle<F>(ctx: &BridgeContext, name: &'static str, action: F)
where
    F: Fn(&CompositorFacade, u64, bool) -> bool + Send + Sync + Copy + 'static,
{
    let facade = ctx.facade.clone();
    ctx.register_command(name, move |args: Vec<Value>| {
        let facade = facade.clone();
        async move {
            let id = view_id_arg(&args)?;
            let state = bool_arg(&args, 1, "state")?;
            let worker = facade.clone();
            let accepted = blocking(move || action(&worker, id, state)).await?;
            Ok(action_reply(name, &facade, accepted))
        }
    });
}

/// `set_workspace x y [view_id]`
fn register_set_workspace(ctx: &BridgeContext) {
    let facade = ctx.facade.clone();
    ctx.register_command("set_workspace", move |args: Vec<Value>| {
        let facade = facade.clone();
        async move {
            let x = coordinate_arg(&args, 0, "workspace x")?;
            let y = coordinate_arg(&args, 1, "workspace y")?;
            let view_id = match args.get(2) {
                None | Some(Value::Null) => None,
                Some(_) => Some(id_arg(&args, 2, "view id")?),
            };
            let worker = facade.clone();
            let accepted = blocking(move || worker.set_workspace(x, y, view_id)).await?;
            Ok(action_reply("set_workspace", &facade, accepted))
        }
    });
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Register every built-in command on the context
pub fn register_builtin_commands(ctx: &Arc<BridgeContext>) {
    ctx.register_command("ping", |_| async { Ok(json!({ "status": "ok", "pong": true })) });

    let commands: Weak<_> = Arc::downgrade(&ctx.commands);
    ctx.register_command("list_commands", move |_| {
        let commands = commands.clone();
        async move {
            let names = commands.upgrade().map(|c| c.names()).unwrap_or_default();
            Ok(ok_reply("list_commands", json!(names)))
        }
    });

    let status_ctx = Arc::downgrade(ctx);
    ctx.register_command("get_status_data", move |_| {
        let status_ctx = status_ctx.clone();
        async move {
            let ctx = status_ctx
                .upgrade()
                .ok_or_else(|| anyhow!("bridge is shutting down"))?;
            Ok(ok_reply("get_status_data", status_data(&ctx)))
        }
    });

    let config = ctx.config.clone();
    ctx.register_command("get_config_data", move |_| {
        let config = config.clone();
        async move {
            let data = serde_json::to_value(config.as_ref())?;
            Ok(ok_reply("get_config_data", data))
        }
    });

    register_query(ctx, "list_views", CompositorFacade::list_views);
    register_query(ctx, "get_focused_view", CompositorFacade::get_focused_view);
    register_query(ctx, "list_outputs", CompositorFacade::list_outputs);
    register_query(ctx, "get_focused_output", CompositorFacade::get_focused_output);
    register_query(ctx, "list_ids", CompositorFacade::list_ids);
    register_query(ctx, "get_current_workspace", CompositorFacade::get_current_workspace);
    register_id_query(ctx, "get_view", "view id", CompositorFacade::get_view);
    register_id_query(ctx, "get_view_geometry", "view id", CompositorFacade::get_view_geometry);
    register_id_query(ctx, "get_output", "output id", CompositorFacade::get_output);
    register_view_action(ctx, "set_focus", CompositorFacade::set_focus);
    register_view_action(ctx, "close_view", CompositorFacade::close_view);
    register_view_toggle(ctx, "set_view_minimized", CompositorFacade::set_view_minimized);
    register_view_toggle(ctx, "set_view_fullscreen", CompositorFacade::set_view_fullscreen);
    register_set_workspace(ctx);
}

fn status_data(ctx: &BridgeContext) -> Value {
    json!({
        "socket": ctx.socket_path(),
        "clients": ctx.clients.len(),
        "commands": ctx.commands.len(),
        "subscribers": ctx.subscribers.len(),
        "compositor": {
            "backend": ctx.facade.backend_kind(),
            "state": ctx.facade.state(),
        },
        "queue": {
            "depth": ctx.queue.len(),
            "capacity": ctx.queue.capacity(),
            "policy": ctx.queue.policy(),
            "dropped": ctx.queue.dropped_count(),
        },
        "timestamp": unix_timestamp(),
    })
}
