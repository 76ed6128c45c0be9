//! Security tests to verify sandbox isolation.
//!
//! These tests attempt various escape techniques to verify the sandbox
//! grants guest code nothing beyond the configured capabilities.

use std::time::Duration;

use quickjs_sandbox_rs::prelude::*;
use serde_json::json;

/// Helper to create the default locked-down options.
fn test_options() -> RuntimeOptions {
    RuntimeOptions::builder()
        .execution_timeout(Duration::from_secs(5))
        .max_memory(32 * 1024 * 1024)
        .build()
}

async fn run(options: RuntimeOptions, code: &str) -> (ExecutionResult, ConsoleOutputText) {
    let mut runtime = create_runtime(options, None).unwrap();
    let console = runtime.console_output().clone();
    let result = runtime
        .eval_code(code, None, EvalOptions::default())
        .await
        .unwrap();
    (result, ConsoleOutputText(console.stdout_str()))
}

struct ConsoleOutputText(String);

impl ConsoleOutputText {
    fn assert_blocked(&self, what: &str) {
        assert!(
            !self.0.contains("SECURITY_BREACH"),
            "{what} should be blocked: {}",
            self.0
        );
        assert!(self.0.contains("BLOCKED"), "{what} should raise: {}", self.0);
    }
}

/// Test that infinite loops are properly terminated.
#[tokio::test]
async fn test_infinite_loop_timeout() {
    let options = RuntimeOptions::builder()
        .execution_timeout(Duration::from_millis(500))
        .build();
    let (result, _) = run(options, "for (;;) {}").await;
    assert!(result.is_timeout(), "infinite loop should time out");
}

/// Test that a loop inside a promise job is also interrupted.
#[tokio::test]
async fn test_loop_in_microtask_timeout() {
    let options = RuntimeOptions::builder()
        .execution_timeout(Duration::from_millis(500))
        .build();
    let (result, _) = run(
        options,
        "await Promise.resolve().then(() => { while (true) {} }); export default 1;",
    )
    .await;
    assert!(result.is_timeout());
}

/// Test that no host I/O globals exist by default.
#[tokio::test]
async fn test_no_ambient_capabilities() {
    let (result, _) = run(
        test_options(),
        r#"
        export default [
            typeof __fs, typeof __net, typeof __env, typeof require,
            typeof process, typeof fetch, typeof setTimeout, typeof std, typeof os,
        ];
        "#,
    )
    .await;
    assert_eq!(
        result.data(),
        Some(&json!([
            "undefined", "undefined", "undefined", "undefined", "undefined",
            "undefined", "undefined", "undefined", "undefined"
        ]))
    );
}

/// Test that touching the filesystem namespace without the grant throws.
#[tokio::test]
async fn test_filesystem_namespace_is_undefined_without_grant() {
    let options = RuntimeOptions::builder()
        .allow_filesystem(false)
        .execution_timeout(Duration::from_secs(5))
        .build();
    let (result, _) = run(options, "export default __fs.readFileSync('/x');").await;
    assert_eq!(result.error().map(|e| e.name.as_str()), Some("ReferenceError"));

    let (result, _) = run(test_options(), "export default typeof Buffer;").await;
    assert_eq!(result.data(), Some(&json!("undefined")));
}

/// Test that filesystem modules cannot be imported without the grant.
#[tokio::test]
async fn test_fs_module_requires_grant() {
    for specifier in ["fs", "node:fs", "qjs:std", "os"] {
        let (result, _) = run(
            test_options(),
            &format!("import * as m from '{specifier}'; export default Object.keys(m);"),
        )
        .await;
        assert_eq!(
            result.error().map(|e| e.name.as_str()),
            Some("ModuleNotFoundError"),
            "{specifier} should not resolve"
        );
    }
}

/// Test that the host filesystem is unreachable through imports.
#[tokio::test]
async fn test_host_paths_not_importable() {
    let options = RuntimeOptions::builder().allow_filesystem(true).build();
    let (result, _) = run(
        options,
        "import data from '/etc/passwd'; export default data;",
    )
    .await;
    assert_eq!(result.error().unwrap().name, "ModuleNotFoundError");
}

/// Test that path traversal stays inside the volume.
#[tokio::test]
async fn test_path_traversal_blocked() {
    let options = RuntimeOptions::builder().allow_filesystem(true).build();
    let (_, stdout) = run(
        options,
        r#"
        try {
            const data = __fs.readFileSync('/src/../../../../etc/passwd', 'utf8');
            console.log('SECURITY_BREACH: read ' + data.length + ' bytes');
        } catch (e) {
            console.log('BLOCKED: ' + e.code);
        }
        "#,
    )
    .await;
    stdout.assert_blocked("path traversal");
    assert!(stdout.0.contains("ENOENT"));
}

/// Test that granted capability objects cannot be tampered with.
#[tokio::test]
async fn test_capabilities_are_frozen() {
    let options = RuntimeOptions::builder()
        .allow_filesystem(true)
        .env("SECRET", "value")
        .build();
    let (result, _) = run(
        options,
        r#"
        'use strict';
        const attempts = [];
        for (const mutate of [
            () => { __fs.readFileSync = () => 'patched'; },
            () => { delete __fs.writeFileSync; },
            () => { __env.get = () => 'patched'; },
        ]) {
            try { mutate(); attempts.push('SECURITY_BREACH'); } catch (e) { attempts.push(e.name); }
        }
        export default attempts;
        "#,
    )
    .await;
    assert_eq!(
        result.data(),
        Some(&json!(["TypeError", "TypeError", "TypeError"]))
    );
}

/// Test that network access is blocked.
#[tokio::test]
async fn test_network_access_blocked() {
    let (_, stdout) = run(
        test_options(),
        r#"
        try {
            await globalThis.__net.fetch('https://example.com');
            console.log('SECURITY_BREACH: network access succeeded');
        } catch (e) {
            console.log('BLOCKED: ' + e.name);
        }
        "#,
    )
    .await;
    stdout.assert_blocked("network access");
}

/// Test that only http(s) URLs are fetched even with the grant.
#[tokio::test]
async fn test_fetch_rejects_file_urls() {
    let options = RuntimeOptions::builder()
        .allow_network(true)
        .execution_timeout(Duration::from_secs(5))
        .build();
    let (_, stdout) = run(
        options,
        r#"
        try {
            await __net.fetch('file:///etc/passwd');
            console.log('SECURITY_BREACH: file url fetched');
        } catch (e) {
            console.log('BLOCKED: ' + e.name);
        }
        "#,
    )
    .await;
    stdout.assert_blocked("file URL fetch");
}

/// Test memory exhaustion protection.
#[tokio::test]
async fn test_memory_exhaustion_protection() {
    let options = RuntimeOptions::builder()
        .execution_timeout(Duration::from_secs(10))
        .max_memory(16 * 1024 * 1024) // 16MB limit
        .build();
    let (result, stdout) = run(
        options,
        r#"
        const data = [];
        for (let i = 0; i < 100000000; i++) data.push('x'.repeat(1000) + i);
        console.log('SECURITY_BREACH: memory exhaustion succeeded');
        "#,
    )
    .await;
    assert!(!result.is_success());
    assert!(!stdout.0.contains("SECURITY_BREACH"));
}

/// Test unbounded recursion protection.
#[tokio::test]
async fn test_stack_overflow_protection() {
    let (result, _) = run(
        test_options(),
        "const f = (n) => f(n + 1) + 1; export default f(0);",
    )
    .await;
    let error = result.error().expect("recursion should fail");
    assert!(!error.is_timeout());
}

/// Test that eval and Function constructors see the same isolated global.
#[tokio::test]
async fn test_eval_sandboxed() {
    let (_, stdout) = run(
        test_options(),
        r#"
        const global = Function('return this')();
        try {
            eval('require("child_process").execSync("echo BREACH")');
            console.log('SECURITY_BREACH: eval bypass');
        } catch (e) {
            console.log('BLOCKED: ' + e.name + ' ' + typeof global.process);
        }
        "#,
    )
    .await;
    stdout.assert_blocked("eval");
    assert!(stdout.0.contains("ReferenceError undefined"));
}

/// Test that prototype pollution does not leak between runtimes.
#[tokio::test]
async fn test_prototype_pollution_isolated() {
    let (first, _) = run(
        test_options(),
        "Object.prototype.polluted = 'yes'; export default ({}).polluted;",
    )
    .await;
    assert_eq!(first.data(), Some(&json!("yes")));

    let (second, _) = run(test_options(), "export default typeof ({}).polluted;").await;
    assert_eq!(second.data(), Some(&json!("undefined")));
}

/// Test that host errors thrown into the guest expose no host internals.
#[tokio::test]
async fn test_host_errors_are_plain_guest_errors() {
    let options = RuntimeOptions::builder().allow_filesystem(true).build();
    let (result, _) = run(
        options,
        r#"
        let error;
        try { __fs.readFileSync(42); } catch (e) { error = e; }
        export default { isError: error instanceof Error, name: error.name, code: error.code };
        "#,
    )
    .await;
    assert_eq!(
        result.data(),
        Some(&json!({ "isError": true, "name": "TypeError", "code": "ERR_INVALID_ARG_TYPE" }))
    );
}

/// Test that guest file sizes cannot drive host allocations.
#[tokio::test]
async fn test_volume_growth_is_bounded() {
    let options = RuntimeOptions::builder()
        .allow_filesystem(true)
        .max_volume_bytes(1024 * 1024)
        .execution_timeout(Duration::from_secs(5))
        .build();
    let (result, stdout) = run(
        options,
        r#"
        const codes = [];
        const attempt = (f) => { try { f(); codes.push('SECURITY_BREACH'); } catch (e) { codes.push(e.code); } };
        __fs.writeFileSync('/src/a.txt', 'hello');
        attempt(() => __fs.truncateSync('/src/a.txt', 2 ** 52));
        attempt(() => __fs.truncateSync('/src/a.txt', 2 * 1024 * 1024));
        const fd = __fs.openSync('/src/a.txt', 'r+');
        attempt(() => __fs.writeSync(fd, 'x', 2 ** 40));
        attempt(() => __fs.ftruncateSync(fd, 2 ** 52));
        const chunk = 'x'.repeat(64 * 1024);
        attempt(() => { for (let i = 0; i < 32; i++) __fs.appendFileSync('/src/big.txt', chunk); });
        console.log('BLOCKED: ' + codes.join());
        export default [codes, __fs.statSync('/src/a.txt').size];
        "#,
    )
    .await;
    stdout.assert_blocked("volume growth");
    assert_eq!(
        result.data(),
        Some(&json!([["EFBIG", "ENOSPC", "EFBIG", "EFBIG", "ENOSPC"], 5]))
    );
}

/// Test that an absurd read length is rejected instead of crashing the host.
#[tokio::test]
async fn test_huge_read_length_is_rejected() {
    let options = RuntimeOptions::builder()
        .allow_filesystem(true)
        .execution_timeout(Duration::from_secs(5))
        .build();
    let (result, _) = run(
        options,
        r#"
        __fs.writeFileSync('/src/a.txt', 'hello');
        const fd = __fs.openSync('/src/a.txt', 'r');
        const buf = new Uint8Array(8);
        let error;
        try { __fs.readSync(fd, buf, 0, 1e20, 1); } catch (e) { error = e; }
        const read = __fs.readSync(fd, buf, 0, 4, 1);
        export default [error.name, error.code, read];
        "#,
    )
    .await;
    assert_eq!(
        result.data(),
        Some(&json!(["RangeError", "ERR_OUT_OF_RANGE", 4]))
    );
}
