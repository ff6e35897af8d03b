use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_core::OutputStream;
use fleet_errors::{FleetError, FleetResult};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 子进程启动参数
///
/// 参数以 argv 形式传递，不经过 shell 拼接。
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// 每个输出流在内存中保留的最大字节数
    pub max_output_bytes: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_output_bytes: 1024 * 1024,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// 把读到的字节解码为文本；末尾不完整的 UTF-8 序列留在 `pending` 中等待下一次读取
fn decode_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[..valid_up_to]));
                match e.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid_up_to + invalid);
                    }
                    None => {
                        pending.drain(..valid_up_to);
                        return text;
                    }
                }
            }
        }
    }
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    sink: Option<mpsc::UnboundedSender<OutputChunk>>,
    limit: usize,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let mut truncated = false;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("读取子进程输出失败: {e}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let data = decode_utf8(&mut pending);
        if data.is_empty() {
            continue;
        }
        truncated |= collect(&mut collected, &data, limit);
        if let Some(sink) = &sink {
            let _ = sink.send(OutputChunk { stream, data });
        }
    }
    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        truncated |= collect(&mut collected, &data, limit);
        if let Some(sink) = &sink {
            let _ = sink.send(OutputChunk { stream, data });
        }
    }
    if truncated {
        collected.push_str("\n[output truncated]\n");
    }
    collected
}

/// 在上限内追加输出，返回是否发生截断
fn collect(collected: &mut String, data: &str, limit: usize) -> bool {
    if collected.len() >= limit {
        return true;
    }
    let room = limit - collected.len();
    if data.len() <= room {
        collected.push_str(data);
        return false;
    }
    let mut cut = room;
    while !data.is_char_boundary(cut) {
        cut -= 1;
    }
    collected.push_str(&data[..cut]);
    true
}

async fn wait_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

async fn wait_cancel(cancel: oneshot::Receiver<()>) {
    // 发送端被丢弃不算取消
    if cancel.await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// 启动子进程并等待结束
///
/// 输出块实时发送到 `sink`，同时在内存中收集。超时或收到取消信号时终止进程。
/// 启动失败返回 `FleetError::Execution`。
pub async fn run_process(
    spec: ProcessSpec,
    sink: Option<mpsc::UnboundedSender<OutputChunk>>,
    cancel: oneshot::Receiver<()>,
) -> FleetResult<ProcessOutcome> {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // 子进程自成进程组，终止时连同其派生的进程一起结束
    #[cfg(unix)]
    cmd.process_group(0);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::Execution(format!("启动命令 {} 失败: {e}", spec.program)))?;
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, "子进程已启动");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FleetError::Execution("无法获取stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FleetError::Execution("无法获取stderr".to_string()))?;

    let stdout_task = tokio::spawn(pump(
        stdout,
        OutputStream::Stdout,
        sink.clone(),
        spec.max_output_bytes,
    ));
    let stderr_task = tokio::spawn(pump(
        stderr,
        OutputStream::Stderr,
        sink,
        spec.max_output_bytes,
    ));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = wait_timeout(spec.timeout) => None,
        _ = wait_cancel(cancel) => None,
    };

    let (exit_code, termination) = match waited {
        Some(Ok(status)) => (status.code(), Termination::Exited),
        Some(Err(e)) => {
            warn!("等待子进程结束失败: {e}");
            (None, Termination::Exited)
        }
        None => {
            let timed_out = spec
                .timeout
                .map(|t| started.elapsed() >= t)
                .unwrap_or(false);
            kill_process_group(pid);
            if let Err(e) = child.kill().await {
                warn!("终止子进程失败: {e}");
            }
            let termination = if timed_out {
                info!(program = %spec.program, "子进程超时，已终止");
                Termination::TimedOut
            } else {
                info!(program = %spec.program, "子进程已取消");
                Termination::Cancelled
            };
            (None, termination)
        }
    };

    let (stdout, stderr) = drain_output(stdout_task, stderr_task, pid).await;

    Ok(ProcessOutcome {
        exit_code,
        stdout,
        stderr,
        termination,
        duration: started.elapsed(),
    })
}

/// 向整个进程组发送 SIGKILL
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, "终止进程组失败: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// 等待输出读取结束
///
/// 主进程退出后仍有后代进程占用管道时，终止整个进程组；
/// 仍未结束则放弃读取。
async fn drain_output(
    mut stdout_task: JoinHandle<String>,
    mut stderr_task: JoinHandle<String>,
    pid: Option<u32>,
) -> (String, String) {
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        tokio::join!(&mut stdout_task, &mut stderr_task)
    })
    .await;
    if let Ok((stdout, stderr)) = drained {
        return (stdout.unwrap_or_default(), stderr.unwrap_or_default());
    }

    warn!(pid = ?pid, "子进程退出后输出管道仍被占用，终止进程组");
    kill_process_group(pid);
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        tokio::join!(&mut stdout_task, &mut stderr_task)
    })
    .await;
    match drained {
        Ok((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
        Err(_) => {
            stdout_task.abort();
            stderr_task.abort();
            (String::new(), String::new())
        }
    }
}
