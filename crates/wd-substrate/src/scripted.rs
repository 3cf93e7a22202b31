//! Scripted runner for tests: canned output, recorded commands, no real
//! processes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::runner::{CommandRunner, RunOutput};
use crate::Result;

struct Rule {
    pattern: String,
    output: RunOutput,
}

/// A [`CommandRunner`] that answers commands from substring rules and keeps
/// files in memory. Unmatched commands succeed with empty output, so tests
/// only script what they assert on.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` answer with `stdout` and exit 0.
    pub fn on(self, pattern: &str, stdout: &str) -> Self {
        self.on_output(
            pattern,
            RunOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        )
    }

    /// Commands containing `pattern` fail with `stderr` and the exit code.
    pub fn on_failure(self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.on_output(
            pattern,
            RunOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        )
    }

    pub fn on_output(self, pattern: &str, output: RunOutput) -> Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            output,
        });
        self
    }

    /// Pre-seed a file on the fake substrate.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    /// Every command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Count of commands containing the pattern.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    fn answer(&self, command: &str) -> RunOutput {
        self.commands.lock().unwrap().push(command.to_string());
        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            if command.contains(&rule.pattern) {
                return rule.output.clone();
            }
        }
        RunOutput::default()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<RunOutput> {
        Ok(self.answer(command))
    }

    async fn run_streaming(
        &self,
        command: &str,
        on_line: &mut (dyn for<'b> FnMut(&'b str) + Send),
    ) -> Result<RunOutput> {
        let output = self.answer(command);
        for line in output.stdout.lines() {
            on_line(line);
        }
        Ok(output)
    }

    async fn write_file(&self, path: &str, content: &[u8], _mode: Option<u32>) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| {
                crate::SubstrateError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    path.to_string(),
                ))
            })
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }
}
