//! Prometheus metrics for task runs, VM lifecycle and the agent loop
//!
//! All metrics live in the default registry; [`encode`] renders them in the
//! text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Encoder, Histogram, HistogramVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Task Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished tasks by terminal status.
    ///
    /// Labels:
    /// - status: "succeeded", "failed" or "timed_out"
    /// - error_kind: taxonomy name, or "none" on success
    pub static ref TASKS_TOTAL: CounterVec = register_counter_vec!(
        "codevisor_tasks_total",
        "Finished coding tasks by terminal status",
        &["status", "error_kind"]
    ).expect("failed to register TASKS_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // VM Lifecycle Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time from provisioning request to a reachable VM.
    pub static ref VM_PROVISION_DURATION: Histogram = register_histogram!(
        "codevisor_vm_provision_duration_seconds",
        "Time from clone request until the VM is reachable",
        vec![5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("failed to register VM_PROVISION_DURATION metric");

    /// Clone attempts, including retries.
    ///
    /// Labels:
    /// - result: "ok", "retry" or "failed"
    pub static ref VM_PROVISION_ATTEMPTS: CounterVec = register_counter_vec!(
        "codevisor_vm_provision_attempts_total",
        "VM clone attempts by result",
        &["result"]
    ).expect("failed to register VM_PROVISION_ATTEMPTS metric");

    pub static ref VM_DESTROYED_TOTAL: Counter = register_counter!(
        "codevisor_vm_destroyed_total",
        "VMs destroyed after a task"
    ).expect("failed to register VM_DESTROYED_TOTAL metric");

    /// Destruction attempts that gave up. Every increment is a leaked VM.
    pub static ref VM_DESTROY_FAILURES: Counter = register_counter!(
        "codevisor_vm_destroy_failures_total",
        "VMs that could not be destroyed"
    ).expect("failed to register VM_DESTROY_FAILURES metric");

    pub static ref ACTIVE_VMS: IntGauge = register_int_gauge!(
        "codevisor_active_vms",
        "Agent VMs currently provisioned"
    ).expect("failed to register ACTIVE_VMS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Steps taken per agent run.
    pub static ref AGENT_STEPS: Histogram = register_histogram!(
        "codevisor_agent_steps",
        "LLM steps per agent run",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 50.0, 100.0]
    ).expect("failed to register AGENT_STEPS metric");

    /// Commands denied by the safety gate.
    ///
    /// Labels:
    /// - rule: matched rule name (e.g. "remote_execution")
    pub static ref POLICY_VIOLATIONS: CounterVec = register_counter_vec!(
        "codevisor_policy_violations_total",
        "Agent commands denied by the safety gate",
        &["rule"]
    ).expect("failed to register POLICY_VIOLATIONS metric");

    /// LLM round-trip latency.
    ///
    /// Labels:
    /// - model: model id from the task
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "codevisor_llm_call_duration_seconds",
        "LLM chat-completion latency",
        &["model"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Verification runs.
    ///
    /// Labels:
    /// - result: "passed", "failed" or "skipped"
    pub static ref VERIFY_RUNS: CounterVec = register_counter_vec!(
        "codevisor_verify_runs_total",
        "Test/build verification runs by result",
        &["result"]
    ).expect("failed to register VERIFY_RUNS metric");
}

/// Render every registered metric in the Prometheus text format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_registered_metrics() {
        VM_DESTROYED_TOTAL.inc();
        POLICY_VIOLATIONS.with_label_values(&["remote_execution"]).inc();
        let text = encode();
        assert!(text.contains("codevisor_vm_destroyed_total"));
        assert!(text.contains("codevisor_policy_violations_total"));
    }
}
