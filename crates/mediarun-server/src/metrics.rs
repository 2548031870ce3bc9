//! Prometheus metrics collection and formatting.
//!
//! This module renders engine state in Prometheus text exposition format.

use std::fmt::Write;

use mediarun_core::TaskStatus;

use crate::engine::Engine;
use crate::pool::PoolSnapshot;

/// Collect all metrics from the engine and format as Prometheus text.
pub async fn collect_metrics(engine: &Engine) -> String {
    let mut output = String::new();

    collect_task_metrics(engine, &mut output).await;
    collect_pool_metrics(&engine.pool_snapshot(), &mut output);
    collect_queue_metrics(engine, &mut output);

    output
}

/// Collect task metrics by status.
async fn collect_task_metrics(engine: &Engine, output: &mut String) {
    let tasks = engine.tasks().await.unwrap_or_default();

    writeln!(
        output,
        "# HELP mediarun_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_tasks_total gauge").ok();
    for status in TaskStatus::ALL {
        let count = tasks.iter().filter(|t| t.status == status).count();
        writeln!(
            output,
            "mediarun_tasks_total{{status=\"{}\"}} {count}",
            status.as_str().to_ascii_lowercase()
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP mediarun_active_runs Tasks currently held by a worker"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_active_runs gauge").ok();
    writeln!(output, "mediarun_active_runs {}", engine.active_runs()).ok();
}

/// Collect model pool occupancy and cache counters.
fn collect_pool_metrics(snapshot: &PoolSnapshot, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP mediarun_pool_budget Memory units available to resident models"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_pool_budget gauge").ok();
    writeln!(output, "mediarun_pool_budget {}", snapshot.budget).ok();

    writeln!(
        output,
        "# HELP mediarun_pool_used Memory units held by resident and loading models"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_pool_used gauge").ok();
    writeln!(output, "mediarun_pool_used {}", snapshot.used).ok();

    writeln!(
        output,
        "# HELP mediarun_pool_resident Resident models by pin state"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_pool_resident gauge").ok();
    for r in &snapshot.resident {
        writeln!(
            output,
            "mediarun_pool_resident{{model=\"{}\",pinned=\"{}\"}} {}",
            r.model, r.pinned, r.footprint
        )
        .ok();
    }

    let stats = snapshot.stats;
    for (name, help, value) in [
        ("hits", "Pool lookups served by a resident model", stats.hits),
        ("misses", "Pool lookups that started a load", stats.misses),
        ("loads", "Completed model loads", stats.loads),
        ("load_failures", "Failed or abandoned model loads", stats.load_failures),
        ("evictions", "Models evicted to make room", stats.evictions),
    ] {
        writeln!(output, "# HELP mediarun_pool_{name}_total {help}").ok();
        writeln!(output, "# TYPE mediarun_pool_{name}_total counter").ok();
        writeln!(output, "mediarun_pool_{name}_total {value}").ok();
    }
}

/// Collect queue depth per worker queue.
fn collect_queue_metrics(engine: &Engine, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP mediarun_queue_depth Tasks waiting for a worker by queue"
    )
    .ok();
    writeln!(output, "# TYPE mediarun_queue_depth gauge").ok();
    for (queue, depth) in engine.queue_depths() {
        writeln!(output, "mediarun_queue_depth{{queue=\"{queue}\"}} {depth}").ok();
    }
}
