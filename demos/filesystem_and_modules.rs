//! Example of guest filesystem access, module imports and a shared volume.
//!
//! Run with: cargo run --example filesystem_and_modules

use std::sync::Arc;

use quickjs_sandbox_rs::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let volume = Arc::new(Volume::from_tree(&json!({
        "src": {
            "greet.ts": "import type { Name } from './types';\nexport const greet = (name) => `hello, ${name}`;",
            "types.ts": "export {};"
        },
        "data": { "people.json": "[\"ada\", \"grace\"]" }
    }))?);

    let options = || {
        RuntimeOptions::builder()
            .allow_filesystem(true)
            .transform_source(true)
            .env("GREETING_SUFFIX", "!")
            .build()
    };

    println!("=== Writer: read data, import a module, write a report ===");
    let mut writer = create_runtime(options(), Some(volume.clone()))?;
    let result = writer
        .eval_code(
            r#"
            import { readFileSync, writeFileSync, mkdirSync } from 'node:fs';
            import { greet } from './greet';

            const people = JSON.parse(readFileSync('/data/people.json', 'utf8'));
            const lines = people.map((p) => greet(p) + __env.get('GREETING_SUFFIX'));
            mkdirSync('/out', { recursive: true });
            writeFileSync('/out/report.js', `export default ${JSON.stringify(lines)};`);
            export default lines.length;
            "#,
            Some("/src/main.ts"),
            EvalOptions::default(),
        )
        .await?;
    println!("result: {}", serde_json::to_string(&result).unwrap_or_default());

    println!("\n=== Host: inspect the volume ===");
    println!("{}", volume.read_to_string("/out/report.js")?);

    println!("\n=== Reader: import what the writer produced ===");
    let mut reader = create_runtime(options(), Some(volume))?;
    let result = reader
        .eval_code(
            "import report from '/out/report.js'; export default report;",
            None,
            EvalOptions::default(),
        )
        .await?;
    println!("result: {}", serde_json::to_string(&result).unwrap_or_default());

    Ok(())
}
