//! Basic example of evaluating JavaScript in the sandbox.
//!
//! Run with: cargo run --example basic_execution
//!
//! Set `RUST_LOG=quickjs_sandbox_rs=debug` to see runtime lifecycle events.

use std::time::Duration;

use quickjs_sandbox_rs::prelude::*;
use tracing_subscriber::EnvFilter;

fn options() -> RuntimeOptions {
    RuntimeOptions::builder()
        .execution_timeout(Duration::from_secs(5))
        .max_memory(32 * 1024 * 1024) // 32MB
        .build()
}

async fn run(label: &str, code: &str) -> Result<()> {
    println!("\n=== {label} ===");
    let mut runtime = create_runtime(options(), None)?;
    let console = runtime.console_output().clone();
    let result = runtime.eval_code(code, None, EvalOptions::default()).await?;

    match &result {
        ExecutionResult::Success(data) => println!("default export: {data}"),
        ExecutionResult::Failure(error) => {
            println!("{}: {}", error.name, error.message);
            println!("syntax error: {}", result.is_syntax_error());
        }
    }
    if !console.stdout.is_empty() {
        print!("console:\n{}", console.stdout_str());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    run("Test 1: Simple arithmetic", "export default 1 + 1;").await?;

    run(
        "Test 2: Loop with console output",
        r#"
        const counts = [];
        for (let i = 0; i < 5; i++) {
            console.log(`Count: ${i}`);
            counts.push(i);
        }
        export default counts;
        "#,
    )
    .await?;

    run("Test 3: Thrown error", "throw new RangeError('test error');").await?;
    run("Test 4: Syntax error", "export default (;").await?;
    run("Test 5: Timeout", "while (true) {}").await?;

    println!("\n=== Test 6: Validation only ===");
    let mut runtime = create_runtime(options(), None)?;
    let validation = runtime.validate_code("export default 1 +;", None, EvalOptions::default())?;
    println!("valid: {}", validation.is_valid());

    Ok(())
}
