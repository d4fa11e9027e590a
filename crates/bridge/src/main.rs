use std::env;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use anyhow::{Context, bail};
use bridge::logging::{DEFAULT_FILTER, init_tracing};
use bridge::{BridgeConfig, QuitStatus, launch};
use guest::toolbox::toolbox;
use serde_json::Value;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "usage:
  modbridge run [--stdin] <args...>    run the module's main entry point
  modbridge call <function> [args...]  call an exported function (args are JSON)
  modbridge functions                  list declared functions";

#[derive(Debug, PartialEq)]
enum Command {
    Run { args: Vec<String>, read_stdin: bool },
    Call { function: String, args: Vec<Value> },
    Functions,
}

fn parse_command(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let Some(command) = args.next() else {
        bail!("{USAGE}");
    };
    match command.as_str() {
        "run" => {
            let mut read_stdin = false;
            let mut program_args = Vec::new();
            for arg in args {
                if arg == "--stdin" && program_args.is_empty() && !read_stdin {
                    read_stdin = true;
                } else {
                    program_args.push(arg);
                }
            }
            Ok(Command::Run {
                args: program_args,
                read_stdin,
            })
        }
        "call" => {
            let function = args
                .next()
                .with_context(|| format!("missing function name\n{USAGE}"))?;
            let args = args
                .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
                .collect();
            Ok(Command::Call { function, args })
        }
        "functions" => Ok(Command::Functions),
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

async fn execute(config: &BridgeConfig, command: Command) -> anyhow::Result<i32> {
    let client = launch(config, toolbox)?;
    client.events().stdout.on(|chunk: &str| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    });
    client.events().stderr.on(|chunk: &str| eprint!("{chunk}"));
    client.events().quit.on(|quit: &QuitStatus| {
        tracing::error!(status = quit.status, error = ?quit.error, "module quit");
    });
    client.events().exit.on(|code: &i32| {
        tracing::info!(code, "module runtime exited");
    });
    client.wait_ready().await?;

    match command {
        Command::Run { args, read_stdin } => {
            let stdin = if read_stdin {
                let mut input = String::new();
                io::stdin()
                    .read_to_string(&mut input)
                    .context("failed to read standard input")?;
                Some(input)
            } else {
                None
            };
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let result = client.run(&args, stdin.as_deref()).await?;
            if let Some(error) = &result.error {
                tracing::debug!(%error, "program ended with an error");
            }
            Ok(result.exit_code)
        }
        Command::Call { function, args } => {
            let Some(remote) = client.function(&function) else {
                bail!(
                    "{function} is not a declared function (declared: {})",
                    client.function_names().join(", ")
                );
            };
            let value = remote.call(args).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(0)
        }
        Command::Functions => {
            for name in client.function_names() {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_FILTER);
    let command = parse_command(env::args().skip(1))?;
    let config = BridgeConfig::from_env()?;
    tracing::debug!(?config, "loaded configuration");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to build tokio runtime")?;
    let code = rt.block_on(execute(&config, command))?;
    io::stdout().flush()?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
