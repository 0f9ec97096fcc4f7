use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use ktl_stack_engine::RunObserver;
use ktl_stack_types::{EventType, RunEvent};

/// Terminal progress: one bar over the node count, event lines above it.
pub struct ProgressObserver {
    bar: ProgressBar,
    verbose: bool,
    done: Mutex<u64>,
}

impl ProgressObserver {
    pub fn new(total_nodes: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total_nodes);
        bar.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                .expect("static template parses"),
        );
        Self {
            bar,
            verbose,
            done: Mutex::new(0),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn bump(&self) {
        let mut done = self.done.lock().expect("progress counter poisoned");
        *done += 1;
        self.bar.set_position(*done);
    }
}

impl RunObserver for ProgressObserver {
    fn on_run_event(&self, event: &RunEvent) {
        let node = event.node_id.as_deref().unwrap_or("-");
        match event.event_type {
            EventType::NodeRunning => {
                self.bar.set_message(node.to_string());
            }
            EventType::NodeSucceeded => {
                self.bump();
                self.bar.println(format!("ok      {node}"));
            }
            EventType::NodeFailed => {
                let will_retry = event.fields.get("willRetry")
                    == Some(&serde_json::Value::Bool(true));
                if !will_retry {
                    self.bump();
                }
                self.bar.println(format!(
                    "failed  {node}: {}",
                    event
                        .error
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or(&event.message)
                ));
            }
            EventType::NodeBlocked => {
                self.bump();
                self.bar.println(format!("blocked {node}: {}", event.message));
            }
            EventType::RetryScheduled => {
                self.bar.println(format!("retry   {node}: {}", event.message));
            }
            EventType::RunConcurrency => {
                self.bar.println(format!("concurrency: {}", event.message));
            }
            EventType::HookFailed => {
                self.bar.println(format!("hook    {node}: {}", event.message));
            }
            _ if self.verbose => {
                self.bar
                    .println(format!("{:18} {node} {}", event.event_type.as_str(), event.message));
            }
            _ => {}
        }
    }

    fn on_ephemeral_event(&self, event: &RunEvent) {
        if self.verbose {
            let node = event.node_id.as_deref().unwrap_or("-");
            for line in event.message.lines() {
                self.bar.println(format!("log     {node}: {line}"));
            }
        }
    }
}
