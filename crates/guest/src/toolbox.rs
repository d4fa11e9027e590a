//! A small busybox-style program used by the demo binaries.
//!
//! `main` dispatches on its first argument:
//!
//! - `cat [path...]` copies files, or standard input when no path is given
//! - `echo args...` prints its arguments
//! - `env [name]` prints one variable or all of them
//! - `ls [path]` lists a directory
//! - `exit <status>` ends the program with a status
//! - `abort [message]` tears the module down
//!
//! Exported functions: `add_values(a, b)`, `greet(name)`, `word_count(path)`.

use serde_json::{Value, json};

use crate::memory::{MemoryModule, ModuleContext};
use crate::module::ModuleError;

pub const FUNCTIONS: &[&str] = &["add_values", "greet", "word_count"];

pub fn toolbox() -> MemoryModule {
    MemoryModule::builder()
        .env("HOME", "/home/user")
        .env("PATH", "/bin")
        .env("USER", "user")
        .file("/home/user/.profile", "export PS1='$ '\n")
        .main(toolbox_main)
        .function("add_values", add_values)
        .function("greet", greet)
        .function("word_count", word_count)
        .build()
}

fn toolbox_main(ctx: &mut ModuleContext<'_>, args: &[String]) -> Result<i32, ModuleError> {
    let Some((command, rest)) = args.split_first() else {
        ctx.eprintln("usage: <command> [args...]");
        return Ok(2);
    };
    match command.as_str() {
        "cat" => cat(ctx, rest),
        "echo" => {
            ctx.println(&rest.join(" "));
            Ok(0)
        }
        "env" => {
            if let Some(name) = rest.first() {
                return match ctx.var(name).map(str::to_owned) {
                    Some(value) => {
                        ctx.println(&value);
                        Ok(0)
                    }
                    None => Ok(1),
                };
            }
            let lines: Vec<String> = ctx
                .vars()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            for line in lines {
                ctx.println(&line);
            }
            Ok(0)
        }
        "ls" => {
            let path = rest.first().map_or("/", String::as_str);
            match ctx.fs().list(path) {
                Ok(entries) => {
                    for entry in entries {
                        ctx.println(&entry);
                    }
                    Ok(0)
                }
                Err(err) => {
                    ctx.eprintln(&format!("ls: {err}"));
                    Ok(1)
                }
            }
        }
        "exit" => {
            let status = rest
                .first()
                .map(|raw| raw.parse::<i32>())
                .transpose()
                .map_err(|err| ModuleError::InvalidArgument(err.to_string()))?
                .unwrap_or(0);
            Err(ctx.exit(status))
        }
        "abort" => {
            let message = rest.first().map_or("abort()", String::as_str).to_owned();
            Err(ctx.quit(134, message))
        }
        other => {
            ctx.eprintln(&format!("{other}: command not found"));
            Ok(127)
        }
    }
}

fn cat(ctx: &mut ModuleContext<'_>, paths: &[String]) -> Result<i32, ModuleError> {
    if paths.is_empty() {
        while let Some(line) = ctx.read_line() {
            ctx.print(&line);
        }
        return Ok(0);
    }
    let mut status = 0;
    for path in paths {
        match ctx.fs().read(path) {
            Ok(content) => ctx.print(&String::from_utf8_lossy(&content)),
            Err(err) => {
                ctx.eprintln(&format!("cat: {err}"));
                status = 1;
            }
        }
    }
    Ok(status)
}

fn add_values(_ctx: &mut ModuleContext<'_>, args: &[Value]) -> Result<Value, ModuleError> {
    let [a, b] = args else {
        return Err(ModuleError::InvalidArgument(format!(
            "add_values expects 2 arguments, got {}",
            args.len()
        )));
    };
    // Integer sums that overflow fall back to floating point.
    let exact = a
        .as_i64()
        .zip(b.as_i64())
        .and_then(|(a, b)| a.checked_add(b));
    if let Some(sum) = exact {
        return Ok(json!(sum));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(ModuleError::InvalidArgument(
            "add_values expects numbers".to_owned(),
        )),
    }
}

fn greet(ctx: &mut ModuleContext<'_>, args: &[Value]) -> Result<Value, ModuleError> {
    let name = args.first().and_then(Value::as_str).unwrap_or("world");
    ctx.println(&format!("greeting {name}"));
    Ok(Value::String(format!("hello, {name}")))
}

fn word_count(ctx: &mut ModuleContext<'_>, args: &[Value]) -> Result<Value, ModuleError> {
    let path = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ModuleError::InvalidArgument("word_count expects a path".to_owned()))?;
    let content = ctx.fs().read(path)?;
    let text = String::from_utf8(content).map_err(|_| ModuleError::InvalidUtf8(path.to_owned()))?;
    Ok(json!(text.split_whitespace().count()))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::module::{ModuleObserver, OutputStream, SandboxModule, Termination};

    #[derive(Default)]
    struct Captured(Mutex<String>);

    impl ModuleObserver for Captured {
        fn on_output(&self, stream: OutputStream, chunk: &str) {
            if stream == OutputStream::Stdout {
                self.0.lock().unwrap().push_str(chunk);
            }
        }

        fn on_ready(&self) {}

        fn on_terminated(&self, _termination: &Termination) {}
    }

    fn ready_toolbox() -> (MemoryModule, Arc<Captured>) {
        let captured = Arc::new(Captured::default());
        let mut module = toolbox();
        module.subscribe(captured.clone());
        module.initialize().unwrap();
        (module, captured)
    }

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test]
    fn exports_declared_functions() {
        let module = toolbox();
        for name in FUNCTIONS {
            assert!(module.has_function(name), "{name} should be exported");
        }
    }

    #[test]
    fn cat_echoes_stdin() {
        let (mut module, captured) = ready_toolbox();
        module.push_stdin("input\n");
        assert_eq!(module.run_main(&args(&["cat"])), Ok(0));
        assert_eq!(*captured.0.lock().unwrap(), "input\n");
    }

    #[test]
    fn env_prints_all_variables_sorted() {
        let (mut module, captured) = ready_toolbox();
        assert_eq!(module.run_main(&args(&["env"])), Ok(0));
        assert_eq!(
            *captured.0.lock().unwrap(),
            "HOME=/home/user\nPATH=/bin\nUSER=user\n"
        );
    }

    #[test]
    fn exit_raises_status() {
        let (mut module, _) = ready_toolbox();
        assert_eq!(
            module.run_main(&args(&["exit", "7"])),
            Err(ModuleError::Exit { status: 7 })
        );
    }

    #[test]
    fn add_values_handles_integers_and_floats() {
        let (mut module, _) = ready_toolbox();
        assert_eq!(
            module.call_function("add_values", &[json!(2), json!(3)]),
            Ok(json!(5))
        );
        assert_eq!(
            module.call_function("add_values", &[json!(0.5), json!(1)]),
            Ok(json!(1.5))
        );
    }

    #[test]
    fn add_values_overflow_falls_back_to_floats() {
        let (mut module, _) = ready_toolbox();
        assert_eq!(
            module.call_function("add_values", &[json!(i64::MAX), json!(1)]),
            Ok(json!(9_223_372_036_854_775_808.0_f64))
        );
        assert_eq!(
            module.call_function("add_values", &[json!(i64::MIN), json!(-1)]),
            Ok(json!(-9_223_372_036_854_775_808.0_f64))
        );
    }

    #[test]
    fn word_count_reads_virtual_file() {
        let (mut module, _) = ready_toolbox();
        module.write_file("/notes.txt", b"one two  three\n").unwrap();
        assert_eq!(
            module.call_function("word_count", &[json!("/notes.txt")]),
            Ok(json!(3))
        );
    }
}
