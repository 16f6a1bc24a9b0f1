//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot for scraping. All families carry the
//! `cluster_autoscaler_` prefix.

use crate::autoscaler::MetricsSnapshot;

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP cluster_autoscaler_{name} {help}\n"));
    out.push_str(&format!("# TYPE cluster_autoscaler_{name} {kind}\n"));
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Render `snapshot` into Prometheus text format.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    header(
        &mut out,
        "function_duration_seconds",
        "summary",
        "Time taken by various parts of the autoscaler main loop.",
    );
    for (function, summary) in &snapshot.function_durations {
        let function = escape(function);
        out.push_str(&format!(
            "cluster_autoscaler_function_duration_seconds_sum{{function=\"{function}\"}} {:.6}\n",
            summary.sum_seconds
        ));
        out.push_str(&format!(
            "cluster_autoscaler_function_duration_seconds_count{{function=\"{function}\"}} {}\n",
            summary.count
        ));
    }

    header(
        &mut out,
        "scaled_up_nodes_total",
        "counter",
        "Number of nodes added by the autoscaler.",
    );
    out.push_str(&format!(
        "cluster_autoscaler_scaled_up_nodes_total {}\n",
        snapshot.scaled_up_nodes_total
    ));

    header(
        &mut out,
        "scaled_up_gpu_nodes_total",
        "counter",
        "Number of GPU nodes added by the autoscaler, by GPU name.",
    );
    for ((resource, gpu), count) in &snapshot.scaled_up_gpu_nodes_total {
        out.push_str(&format!(
            "cluster_autoscaler_scaled_up_gpu_nodes_total{{gpu_resource_name=\"{}\",gpu_name=\"{}\"}} {count}\n",
            escape(resource),
            escape(gpu)
        ));
    }

    header(
        &mut out,
        "failed_scale_ups_total",
        "counter",
        "Number of times scale-up operation has failed.",
    );
    for (reason, count) in &snapshot.failed_scale_ups_total {
        out.push_str(&format!(
            "cluster_autoscaler_failed_scale_ups_total{{reason=\"{}\"}} {count}\n",
            escape(reason)
        ));
    }

    header(
        &mut out,
        "failed_gpu_scale_ups_total",
        "counter",
        "Number of times scale-up operation has failed, by GPU name.",
    );
    for ((reason, resource, gpu), count) in &snapshot.failed_gpu_scale_ups_total {
        out.push_str(&format!(
            "cluster_autoscaler_failed_gpu_scale_ups_total{{reason=\"{}\",gpu_resource_name=\"{}\",gpu_name=\"{}\"}} {count}\n",
            escape(reason),
            escape(resource),
            escape(gpu)
        ));
    }

    header(
        &mut out,
        "skipped_scale_events_count",
        "counter",
        "Count of scaling events skipped because a resource limit was reached.",
    );
    for ((direction, reason), count) in &snapshot.skipped_scale_events_count {
        out.push_str(&format!(
            "cluster_autoscaler_skipped_scale_events_count{{direction=\"{}\",reason=\"{}\"}} {count}\n",
            escape(direction),
            escape(reason)
        ));
    }

    header(
        &mut out,
        "created_node_groups_total",
        "counter",
        "Number of node groups created by node autoprovisioning.",
    );
    out.push_str(&format!(
        "cluster_autoscaler_created_node_groups_total {}\n",
        snapshot.created_node_groups_total
    ));

    header(
        &mut out,
        "errors_total",
        "counter",
        "The number of autoscaler errors, by type.",
    );
    for (kind, count) in &snapshot.errors_total {
        out.push_str(&format!(
            "cluster_autoscaler_errors_total{{type=\"{}\"}} {count}\n",
            escape(kind)
        ));
    }

    out
}
