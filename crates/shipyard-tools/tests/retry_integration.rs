use shipyard_tools::fakes::ScriptedRunner;
use shipyard_tools::{run_with_retries, CommandOutput, Invocation, RetryPolicy, ToolError};

fn cosign_sign() -> Invocation {
    Invocation::new("cosign")
        .arg("sign")
        .arg("quay.io/mongodb/operator@sha256:abc")
}

#[tokio::test(start_paused = true)]
async fn retries_until_tool_recovers() {
    let runner = ScriptedRunner::new();
    runner.on_sequence(
        "cosign sign",
        [
            CommandOutput::failed(1, "Error: 502 Bad Gateway"),
            CommandOutput::failed(1, "context deadline exceeded: timeout"),
            CommandOutput::ok("tlog entry skipped"),
        ],
    );

    let out = run_with_retries(&runner, &cosign_sign(), &RetryPolicy::signing())
        .await
        .expect("third attempt succeeds");

    assert_eq!(out.stdout, "tlog entry skipped");
    assert_eq!(runner.count_matching("cosign sign"), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausts_after_policy_attempts() {
    let runner = ScriptedRunner::new();
    runner.on("cosign sign", CommandOutput::failed(1, "429 Too Many Requests"));

    let policy = RetryPolicy::verification();
    let err = run_with_retries(&runner, &cosign_sign(), &policy)
        .await
        .unwrap_err();

    assert!(matches!(err, ToolError::RetriesExhausted { attempts: 10, .. }));
    assert_eq!(runner.count_matching("cosign sign"), 10);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let runner = ScriptedRunner::new();
    runner.on("cosign sign", CommandOutput::failed(1, "invalid key reference"));

    let err = run_with_retries(&runner, &cosign_sign(), &RetryPolicy::signing())
        .await
        .unwrap_err();

    assert!(matches!(err, ToolError::Failed { exit_code: 1, .. }));
    assert_eq!(runner.calls().len(), 1);
}
