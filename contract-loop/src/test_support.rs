//! Test-only helpers: a scripted tool invoker and config fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde_json::{Value, json};

use crate::core::types::{ToolKind, ToolResult};
use crate::io::config::LoopConfig;
use crate::io::tool::ToolInvoker;

/// A scripted response; optionally writes `output_path` like a real executor.
#[derive(Debug, Clone)]
struct Scripted {
    response: Value,
    write_output: Option<String>,
}

/// Invoker that replays queued responses per tool kind and records requests.
///
/// An exhausted queue yields a failure result naming the tool, so unexpected
/// calls show up in assertions instead of hanging.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    queues: Mutex<HashMap<ToolKind, VecDeque<Scripted>>>,
    requests: Mutex<Vec<(ToolKind, Value)>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generator(self, response: Value) -> Self {
        self.push(ToolKind::Generator, response, None)
    }

    pub fn executor(self, response: Value) -> Self {
        self.push(ToolKind::Executor, response, None)
    }

    /// Executor response that also writes `contents` to the requested output path.
    pub fn executor_writing(self, response: Value, contents: &str) -> Self {
        self.push(ToolKind::Executor, response, Some(contents.to_string()))
    }

    pub fn validator(self, response: Value) -> Self {
        self.push(ToolKind::Validator, response, None)
    }

    fn push(self, tool: ToolKind, response: Value, write_output: Option<String>) -> Self {
        self.queues
            .lock()
            .expect("queues lock")
            .entry(tool)
            .or_default()
            .push_back(Scripted {
                response,
                write_output,
            });
        self
    }

    /// Requests received by `tool`, in call order.
    pub fn requests(&self, tool: ToolKind) -> Vec<Value> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|(kind, _)| *kind == tool)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn calls(&self, tool: ToolKind) -> usize {
        self.requests(tool).len()
    }

    /// Panics if any scripted response was never consumed.
    pub fn assert_drained(&self) {
        let queues = self.queues.lock().expect("queues lock");
        for (tool, queue) in queues.iter() {
            assert!(
                queue.is_empty(),
                "{} scripted {tool} response(s) left unused",
                queue.len()
            );
        }
    }
}

impl ToolInvoker for ScriptedInvoker {
    fn invoke(&self, tool: ToolKind, request: &Value) -> ToolResult {
        self.requests
            .lock()
            .expect("requests lock")
            .push((tool, request.clone()));
        let next = self
            .queues
            .lock()
            .expect("queues lock")
            .get_mut(&tool)
            .and_then(VecDeque::pop_front);
        let Some(scripted) = next else {
            return ToolResult::failure(format!("no scripted response for {tool}"));
        };
        if let Some(contents) = scripted.write_output
            && let Some(path) = request.get("output_path").and_then(Value::as_str)
        {
            fs::write(path, contents).expect("write scripted output");
        }
        ToolResult::new(scripted.response)
    }
}

/// Validator response with the given validity flag.
pub fn validation(valid: bool) -> Value {
    json!({"success": true, "data": {"valid": valid}})
}

/// Default config with workspaces allocated under `base`.
pub fn test_config(base: &Path) -> LoopConfig {
    LoopConfig {
        workspace_dir: Some(base.to_path_buf()),
        ..LoopConfig::default()
    }
}
