//! invoke-demo: a small CLI running through the standout-invoke pipeline.
//!
//! Try:
//!
//! ```text
//! invoke-demo greet --name Ada
//! invoke-demo stauts                 # typo suggestion + parse error
//! invoke-demo [parse] greet --name Ada
//! invoke-demo [suggest] gr
//! invoke-demo wait --seconds 30      # press Ctrl+C
//! invoke-demo fail
//! RUST_LOG=standout_invoke=debug invoke-demo db
//! ```

use std::io::Write;
use std::time::{Duration, Instant};

use clap::{Arg, Command};
use standout_invoke::{Pipeline, Priority, INTERRUPT_EXIT_CODE};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("invoke-demo")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Demonstrates the standout-invoke pipeline")
        .subcommand(
            Command::new("greet")
                .about("Print a greeting")
                .arg(Arg::new("name").long("name").default_value("world")),
        )
        .subcommand(
            Command::new("wait")
                .about("Wait, honoring Ctrl+C")
                .arg(
                    Arg::new("seconds")
                        .long("seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("5"),
                ),
        )
        .subcommand(Command::new("fail").about("Fail with an unhandled error"))
        .subcommand(
            Command::new("db")
                .about("Database commands")
                .subcommand(Command::new("migrate").about("Apply pending migrations")),
        )
}

fn build() -> anyhow::Result<Pipeline> {
    let pipeline = Pipeline::builder(cli())
        .use_defaults()
        .add_fn(Priority::Default, |ctx, next| {
            Box::pin(async move {
                let started = Instant::now();
                let outcome = next.run(ctx).await;
                let elapsed = started.elapsed();
                tracing::debug!(?elapsed, code = ctx.result_code(), "command finished");
                outcome
            })
        })
        .command_fn("greet", |ctx| {
            Box::pin(async move {
                let name = ctx
                    .parse_result()
                    .deepest_matches()
                    .and_then(|m| m.get_one::<String>("name").cloned())
                    .unwrap_or_default();
                writeln!(ctx.console().out(), "Hello, {}!", name)?;
                Ok(0)
            })
        })?
        .command_fn("wait", |ctx| {
            Box::pin(async move {
                let seconds = ctx
                    .parse_result()
                    .deepest_matches()
                    .and_then(|m| m.get_one::<u64>("seconds").copied())
                    .unwrap_or(5);
                let token = ctx.cancellation_token();
                tokio::select! {
                    _ = token.cancelled() => {
                        writeln!(ctx.console().err(), "interrupted")?;
                        Ok(INTERRUPT_EXIT_CODE)
                    }
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                        writeln!(ctx.console().out(), "waited {}s", seconds)?;
                        Ok(0)
                    }
                }
            })
        })?
        .command_fn("fail", |_ctx| {
            Box::pin(async { Err(anyhow::anyhow!("the demo failed on purpose")) })
        })?
        .command_fn("db.migrate", |ctx| {
            Box::pin(async move {
                writeln!(ctx.console().out(), "nothing to migrate")?;
                Ok(0)
            })
        })?
        .build();
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let pipeline = build()?;
    let code = pipeline.invoke(std::env::args()).await?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use standout_invoke::BufferConsole;

    async fn run(args: &[&str]) -> (i32, BufferConsole) {
        let console = BufferConsole::new();
        let code = build()
            .unwrap()
            .invoke_with(args.iter().copied(), Box::new(console.clone()))
            .await
            .unwrap();
        (code, console)
    }

    #[tokio::test]
    async fn test_greet() {
        let (code, console) = run(&["invoke-demo", "greet", "--name", "Ada"]).await;
        assert_eq!(code, 0);
        assert_eq!(console.out_text(), "Hello, Ada!\n");
    }

    #[tokio::test]
    async fn test_group_shows_help() {
        let (code, console) = run(&["invoke-demo", "db"]).await;
        assert_eq!(code, 0);
        assert!(console.out_text().contains("migrate"));
    }

    #[tokio::test]
    async fn test_fail_is_contained() {
        let (code, console) = run(&["invoke-demo", "fail"]).await;
        assert_eq!(code, 1);
        assert!(console.err_text().contains("the demo failed on purpose"));
    }
}
