use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::adb::commands;
use crate::adb::runner::AdbInvoker;
use crate::dispatch::{CancelToken, TaskContext, TaskDispatcher};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::logging::new_trace_id;
use crate::models::{
    CommandBlock, CommandResult, ConnectionState, OperationEvent, OperationType,
};
use crate::status::StatusManager;

#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub serial: String,
    pub state: ConnectionState,
    pub device_name: Option<String>,
}

/// Handle over one fan-out command run: group-wide cancellation plus access
/// to the assembled block.
pub struct ShellRunHandle {
    token: CancelToken,
    block_rx: Receiver<CommandBlock>,
    collector: Option<JoinHandle<()>>,
}

impl ShellRunHandle {
    /// Cancel every per-device job in the group with one call.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn wait_block(&self, timeout: Duration) -> Option<CommandBlock> {
        self.block_rx.recv_timeout(timeout).ok()
    }

    pub fn join(mut self) {
        if let Some(join) = self.collector.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ShellRunHandle {
    fn drop(&mut self) {
        if let Some(join) = self.collector.take() {
            let _ = join.join();
        }
    }
}

pub struct BatchRunHandle {
    token: CancelToken,
    join: Option<JoinHandle<Vec<CommandBlock>>>,
}

impl BatchRunHandle {
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn join(mut self) -> Vec<CommandBlock> {
        self.join
            .take()
            .map(|join| join.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Runs shell commands across selected devices through the dispatcher and
/// publishes per-command blocks in stable requested order.
pub struct ShellExecutor {
    dispatcher: Arc<TaskDispatcher>,
    bus: EventBus,
    status: Arc<StatusManager>,
    invoker: AdbInvoker,
}

impl ShellExecutor {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        bus: EventBus,
        status: Arc<StatusManager>,
        invoker: AdbInvoker,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            status,
            invoker,
        }
    }

    /// Fan one command across the targets. Devices not in `device` state fail
    /// fast with `DeviceUnavailable` while their peers continue.
    pub fn run_command(
        &self,
        targets: &[ShellTarget],
        command: &str,
        timeout: Duration,
    ) -> Result<ShellRunHandle, CoreError> {
        if targets.is_empty() {
            return Err(CoreError::config("no devices selected"));
        }
        if command.trim().is_empty() {
            return Err(CoreError::config("command is required"));
        }

        let trace_id = new_trace_id();
        let group_token = CancelToken::new();
        let slots: Arc<Mutex<Vec<Option<CommandResult>>>> =
            Arc::new(Mutex::new(vec![None; targets.len()]));
        let mut waiters = Vec::with_capacity(targets.len());

        for (index, target) in targets.iter().enumerate() {
            let event = OperationEvent::create(
                target.serial.clone(),
                OperationType::ShellCommand,
                target.device_name.clone(),
                Some(truncate_command(command)),
                true,
            );
            let cancel_token = group_token.clone();
            let operation_id = self.status.add(
                event,
                Some(Box::new(move || {
                    cancel_token.cancel();
                    true
                })),
            );

            if !target.state.is_operational() {
                let error = CoreError::DeviceUnavailable {
                    serial: target.serial.clone(),
                    state: target.state,
                };
                self.status.fail(&operation_id, error.summary_line());
                slots.lock().expect("shell slots poisoned")[index] = Some(CommandResult {
                    serial: target.serial.clone(),
                    command: command.to_string(),
                    lines: Vec::new(),
                    exit_code: Some(1),
                    duration_seconds: 0.0,
                    error: Some(error),
                });
                continue;
            }

            let serial = target.serial.clone();
            let command_owned = command.to_string();
            let invoker = Arc::clone(&self.invoker);
            let status = Arc::clone(&self.status);
            let dispatcher = Arc::clone(&self.dispatcher);
            let slots_clone = Arc::clone(&slots);
            let op_id = operation_id.clone();

            let handle = self.dispatcher.submit_with_token(
                TaskContext::for_device("run_shell", "shell", serial.clone()),
                group_token.clone(),
                move |token| {
                    status.update(
                        &op_id,
                        crate::status::OperationPatch::running("Running command"),
                    );
                    let device_lock = dispatcher.device_lock(&serial);
                    let _guard = device_lock
                        .lock()
                        .map_err(|_| CoreError::io("device lock poisoned"))?;
                    token.checkpoint()?;

                    let args = commands::shell(&serial, &command_owned);
                    let result = match invoker(&args, timeout, token) {
                        Ok(output) => {
                            let exit_code = output.exit_code;
                            let result = CommandResult {
                                serial: serial.clone(),
                                command: command_owned.clone(),
                                lines: output.lines(),
                                exit_code,
                                duration_seconds: output.duration.as_secs_f64(),
                                error: None,
                            };
                            if exit_code == Some(0) {
                                status.complete(&op_id, None);
                            } else {
                                status.fail(
                                    &op_id,
                                    format!("exit code {}", exit_code.unwrap_or(-1)),
                                );
                            }
                            result
                        }
                        Err(err) => {
                            if matches!(err, CoreError::Cancelled) {
                                status.update(
                                    &op_id,
                                    crate::status::OperationPatch::status(
                                        crate::models::OperationStatus::Cancelled,
                                    ),
                                );
                            } else {
                                status.fail(&op_id, err.summary_line());
                            }
                            CommandResult {
                                serial: serial.clone(),
                                command: command_owned.clone(),
                                lines: Vec::new(),
                                exit_code: None,
                                duration_seconds: 0.0,
                                error: Some(err),
                            }
                        }
                    };
                    slots_clone.lock().expect("shell slots poisoned")[index] = Some(result);
                    Ok(())
                },
            )?;
            waiters.push((index, target.serial.clone(), operation_id, handle));
        }

        let bus = self.bus.clone();
        let status = Arc::clone(&self.status);
        let command_owned = command.to_string();
        let targets_owned: Vec<ShellTarget> = targets.to_vec();
        let (block_tx, block_rx) = channel();

        let collector = thread::spawn(move || {
            for (index, serial, operation_id, handle) in waiters {
                match handle.wait() {
                    Ok(()) => {}
                    Err(CoreError::Cancelled) => {
                        debug!(serial = %serial, "shell job cancelled");
                        status.update(
                            &operation_id,
                            crate::status::OperationPatch::status(
                                crate::models::OperationStatus::Cancelled,
                            ),
                        );
                        slots.lock().expect("shell slots poisoned")[index] =
                            Some(CommandResult {
                                serial: serial.clone(),
                                command: command_owned.clone(),
                                lines: Vec::new(),
                                exit_code: None,
                                duration_seconds: 0.0,
                                error: Some(CoreError::Cancelled),
                            });
                    }
                    Err(err) => {
                        warn!(serial = %serial, error = %err, "shell job errored");
                        slots.lock().expect("shell slots poisoned")[index]
                            .get_or_insert(CommandResult {
                                serial: serial.clone(),
                                command: command_owned.clone(),
                                lines: Vec::new(),
                                exit_code: None,
                                duration_seconds: 0.0,
                                error: Some(err),
                            });
                    }
                }
            }

            // Stable requested order, one entry per target.
            let results: Vec<CommandResult> = {
                let guard = slots.lock().expect("shell slots poisoned");
                targets_owned
                    .iter()
                    .enumerate()
                    .map(|(index, target)| {
                        guard[index].clone().unwrap_or_else(|| CommandResult {
                            serial: target.serial.clone(),
                            command: command_owned.clone(),
                            lines: Vec::new(),
                            exit_code: None,
                            duration_seconds: 0.0,
                            error: Some(CoreError::io("no result recorded")),
                        })
                    })
                    .collect()
            };
            let block = CommandBlock {
                command: command_owned.clone(),
                results,
                trace_id,
            };
            bus.publish(CoreEvent::CommandBlockReady {
                block: block.clone(),
            });
            let _ = block_tx.send(block);
        });

        Ok(ShellRunHandle {
            token: group_token,
            block_rx,
            collector: Some(collector),
        })
    }

    /// Batch mode: each non-comment, non-empty line runs as its own command,
    /// sequentially, one block per command.
    pub fn run_batch(
        &self,
        targets: Vec<ShellTarget>,
        script: &str,
        timeout: Duration,
    ) -> BatchRunHandle {
        let commands: Vec<String> = script
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        let token = CancelToken::new();
        let token_thread = token.clone();
        let executor = self.clone_for_batch();
        let join = thread::spawn(move || {
            let mut blocks = Vec::new();
            for command in commands {
                if token_thread.is_cancelled() {
                    break;
                }
                match executor.run_command(&targets, &command, timeout) {
                    Ok(handle) => {
                        if let Some(block) = handle.wait_block(timeout + Duration::from_secs(30)) {
                            blocks.push(block);
                        }
                        handle.join();
                    }
                    Err(err) => {
                        warn!(error = %err, command = %command, "batch command rejected");
                    }
                }
            }
            blocks
        });
        BatchRunHandle {
            token,
            join: Some(join),
        }
    }

    fn clone_for_batch(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            bus: self.bus.clone(),
            status: Arc::clone(&self.status),
            invoker: Arc::clone(&self.invoker),
        }
    }
}

fn truncate_command(command: &str) -> String {
    const MAX: usize = 60;
    let line = command.lines().next().unwrap_or("");
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}
