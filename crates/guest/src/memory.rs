use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::fs::MemoryFs;
use crate::module::{
    Environment, ModuleError, ModuleObserver, OutputStream, SandboxModule, Termination,
};

pub type MainFn =
    Box<dyn FnMut(&mut ModuleContext<'_>, &[String]) -> Result<i32, ModuleError> + Send>;
pub type ExportFn =
    Box<dyn FnMut(&mut ModuleContext<'_>, &[Value]) -> Result<Value, ModuleError> + Send>;

#[derive(Default)]
struct ModuleState {
    fs: MemoryFs,
    env: Environment,
    stdin: String,
    observers: Vec<Arc<dyn ModuleObserver>>,
    initialized: bool,
    terminated: Option<Termination>,
}

impl ModuleState {
    fn emit(&self, stream: OutputStream, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        for observer in &self.observers {
            observer.on_output(stream, chunk);
        }
    }

    fn terminate(&mut self, termination: Termination) -> ModuleError {
        for observer in &self.observers {
            observer.on_terminated(&termination);
        }
        self.terminated = Some(termination.clone());
        ModuleError::Terminated(termination)
    }

    fn ensure_usable(&self) -> Result<(), ModuleError> {
        if let Some(termination) = &self.terminated {
            return Err(ModuleError::Terminated(termination.clone()));
        }
        if !self.initialized {
            return Err(ModuleError::NotInitialized);
        }
        Ok(())
    }
}

/// What program code sees while it runs inside a `MemoryModule`.
pub struct ModuleContext<'a> {
    state: &'a mut ModuleState,
}

impl ModuleContext<'_> {
    pub fn print(&mut self, text: &str) {
        self.state.emit(OutputStream::Stdout, text);
    }

    pub fn println(&mut self, text: &str) {
        self.state.emit(OutputStream::Stdout, &format!("{text}\n"));
    }

    pub fn eprint(&mut self, text: &str) {
        self.state.emit(OutputStream::Stderr, text);
    }

    pub fn eprintln(&mut self, text: &str) {
        self.state.emit(OutputStream::Stderr, &format!("{text}\n"));
    }

    /// Next character of standard input, `None` at end of input.
    pub fn read_char(&mut self) -> Option<char> {
        let next = self.state.stdin.chars().next()?;
        self.state.stdin.drain(..next.len_utf8());
        Some(next)
    }

    /// Next line including its terminator, `None` at end of input.
    pub fn read_line(&mut self) -> Option<String> {
        if self.state.stdin.is_empty() {
            return None;
        }
        let end = self
            .state
            .stdin
            .find('\n')
            .map_or(self.state.stdin.len(), |idx| idx + 1);
        Some(self.state.stdin.drain(..end).collect())
    }

    pub fn read_to_end(&mut self) -> String {
        std::mem::take(&mut self.state.stdin)
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.state.env.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.state
            .env
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.state.env.insert(name.into(), value.into());
    }

    pub fn fs(&self) -> &MemoryFs {
        &self.state.fs
    }

    pub fn fs_mut(&mut self) -> &mut MemoryFs {
        &mut self.state.fs
    }

    /// Ends the current program with `status`; the module stays usable.
    pub fn exit(&mut self, status: i32) -> ModuleError {
        ModuleError::Exit { status }
    }

    /// Tears the whole module down abnormally.
    pub fn quit(&mut self, status: i32, error: impl Into<String>) -> ModuleError {
        self.state.terminate(Termination::Quit {
            status,
            error: Some(error.into()),
        })
    }

    /// Shuts the module runtime down with `code`.
    pub fn exit_runtime(&mut self, code: i32) -> ModuleError {
        self.state.terminate(Termination::Exit { code })
    }
}

/// Reference `SandboxModule` backed by Rust closures and an in-memory filesystem.
pub struct MemoryModule {
    state: ModuleState,
    main: Option<MainFn>,
    functions: BTreeMap<String, ExportFn>,
}

impl MemoryModule {
    pub fn builder() -> MemoryModuleBuilder {
        MemoryModuleBuilder::default()
    }

    pub fn fs(&self) -> &MemoryFs {
        &self.state.fs
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }
}

impl SandboxModule for MemoryModule {
    fn subscribe(&mut self, observer: Arc<dyn ModuleObserver>) {
        self.state.observers.push(observer);
    }

    fn initialize(&mut self) -> Result<(), ModuleError> {
        if self.state.initialized {
            return Ok(());
        }
        self.state.initialized = true;
        tracing::debug!(
            functions = self.functions.len(),
            env = self.state.env.len(),
            "memory module initialized"
        );
        for observer in &self.state.observers {
            observer.on_ready();
        }
        Ok(())
    }

    fn run_main(&mut self, args: &[String]) -> Result<i32, ModuleError> {
        self.state.ensure_usable()?;
        let main = self.main.as_mut().ok_or(ModuleError::NoMain)?;
        let mut ctx = ModuleContext {
            state: &mut self.state,
        };
        main(&mut ctx, args)
    }

    fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, ModuleError> {
        self.state.ensure_usable()?;
        let function = self
            .functions
            .get_mut(name)
            .ok_or_else(|| ModuleError::InvalidFunction(name.to_owned()))?;
        let mut ctx = ModuleContext {
            state: &mut self.state,
        };
        function(&mut ctx, args)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, ModuleError> {
        self.state.ensure_usable()?;
        self.state.fs.read(path)
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), ModuleError> {
        self.state.ensure_usable()?;
        self.state.fs.write(path, content)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), ModuleError> {
        self.state.ensure_usable()?;
        self.state.fs.mkdir(path)
    }

    fn environment(&mut self) -> &mut Environment {
        &mut self.state.env
    }

    fn push_stdin(&mut self, chunk: &str) {
        self.state.stdin.push_str(chunk);
    }

    fn clear_stdin(&mut self) {
        self.state.stdin.clear();
    }
}

#[derive(Default)]
pub struct MemoryModuleBuilder {
    state: ModuleState,
    main: Option<MainFn>,
    functions: BTreeMap<String, ExportFn>,
}

impl MemoryModuleBuilder {
    pub fn main<F>(mut self, main: F) -> Self
    where
        F: FnMut(&mut ModuleContext<'_>, &[String]) -> Result<i32, ModuleError> + Send + 'static,
    {
        self.main = Some(Box::new(main));
        self
    }

    pub fn function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: FnMut(&mut ModuleContext<'_>, &[Value]) -> Result<Value, ModuleError> + Send + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.env.insert(name.into(), value.into());
        self
    }

    /// Preloads a file, creating missing parent directories.
    pub fn file(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        let normalized = crate::fs::normalize(path);
        let mut dir = String::new();
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        if let Some((_, parents)) = segments.split_last() {
            for segment in parents {
                dir.push('/');
                dir.push_str(segment);
                if !self.state.fs.exists(&dir) {
                    let _ = self.state.fs.mkdir(&dir);
                }
            }
        }
        let _ = self.state.fs.write(&normalized, content.as_ref());
        self
    }

    pub fn build(self) -> MemoryModule {
        MemoryModule {
            state: self.state,
            main: self.main,
            functions: self.functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        output: Mutex<Vec<(OutputStream, String)>>,
        ready: Mutex<usize>,
        terminated: Mutex<Vec<Termination>>,
    }

    impl ModuleObserver for Recorder {
        fn on_output(&self, stream: OutputStream, chunk: &str) {
            self.output.lock().unwrap().push((stream, chunk.to_owned()));
        }

        fn on_ready(&self) {
            *self.ready.lock().unwrap() += 1;
        }

        fn on_terminated(&self, termination: &Termination) {
            self.terminated.lock().unwrap().push(termination.clone());
        }
    }

    fn echo_module() -> MemoryModule {
        MemoryModule::builder()
            .main(|ctx, _args| {
                while let Some(line) = ctx.read_line() {
                    ctx.print(&line);
                }
                Ok(0)
            })
            .build()
    }

    #[test]
    fn calls_before_initialize_are_rejected() {
        let mut module = echo_module();
        assert_eq!(module.run_main(&[]), Err(ModuleError::NotInitialized));
    }

    #[test]
    fn initialize_fires_ready_once() {
        let recorder = Arc::new(Recorder::default());
        let mut module = echo_module();
        module.subscribe(recorder.clone());
        module.initialize().unwrap();
        module.initialize().unwrap();
        assert_eq!(*recorder.ready.lock().unwrap(), 1);
    }

    #[test]
    fn output_is_emitted_per_chunk() {
        let recorder = Arc::new(Recorder::default());
        let mut module = echo_module();
        module.subscribe(recorder.clone());
        module.initialize().unwrap();
        module.push_stdin("one\ntwo\n");
        assert_eq!(module.run_main(&[]), Ok(0));
        let output = recorder.output.lock().unwrap();
        assert_eq!(
            *output,
            vec![
                (OutputStream::Stdout, "one\n".to_owned()),
                (OutputStream::Stdout, "two\n".to_owned()),
            ]
        );
    }

    #[test]
    fn cleared_stdin_reads_as_end_of_input() {
        let mut module = MemoryModule::builder()
            .main(|ctx, _args| Ok(if ctx.read_char().is_none() { 0 } else { 1 }))
            .build();
        module.initialize().unwrap();
        module.push_stdin("pending");
        module.clear_stdin();
        assert_eq!(module.run_main(&[]), Ok(0));
    }

    #[test]
    fn quit_terminates_module() {
        let recorder = Arc::new(Recorder::default());
        let mut module = MemoryModule::builder()
            .main(|ctx, _args| Err(ctx.quit(3, "abort()")))
            .build();
        module.subscribe(recorder.clone());
        module.initialize().unwrap();

        let termination = Termination::Quit {
            status: 3,
            error: Some("abort()".to_owned()),
        };
        assert_eq!(
            module.run_main(&[]),
            Err(ModuleError::Terminated(termination.clone()))
        );
        assert_eq!(*recorder.terminated.lock().unwrap(), vec![termination.clone()]);
        assert_eq!(
            module.read_file("/"),
            Err(ModuleError::Terminated(termination))
        );
    }

    #[test]
    fn builder_preloads_nested_files() {
        let mut module = MemoryModule::builder()
            .file("/etc/app/config.toml", "debug = true")
            .build();
        module.initialize().unwrap();
        assert!(module.fs().is_dir("/etc/app"));
        assert_eq!(
            module.read_file("/etc/app/config.toml").unwrap(),
            b"debug = true"
        );
    }
}
