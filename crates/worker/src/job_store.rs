use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use fleet_core::{RemoteJob, RemoteJobStatus};
use fleet_errors::{FleetError, FleetResult};

pub const JOB_SCRIPT: &str = "run.sh";
pub const JOB_CONFIG: &str = "job.json";
pub const JOB_LOG: &str = "output.log";

const RESTART_ERROR: &str = "agent restarted";

/// 作业目录中的 `job.json`
///
/// 未知字段原样保留，回写状态时不会丢失。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RemoteJobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// 一个已解析的作业目录
#[derive(Debug, Clone)]
pub struct JobDir {
    pub job_id: String,
    pub dir: PathBuf,
}

impl JobDir {
    pub fn script(&self) -> PathBuf {
        self.dir.join(JOB_SCRIPT)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(JOB_CONFIG)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(JOB_LOG)
    }

    /// 读取 job.json，不存在时返回默认配置
    pub async fn load_config(&self) -> FleetResult<JobConfig> {
        read_config(&self.config_path())
            .await
            .map(Option::unwrap_or_default)
    }

    /// 把执行状态写回 job.json
    pub async fn write_status(&self, job: &RemoteJob) -> FleetResult<()> {
        let mut config = self.load_config().await.unwrap_or_else(|e| {
            warn!(job_id = %self.job_id, "job.json 无法解析，将被覆盖: {e}");
            JobConfig::default()
        });
        config.status = Some(job.status);
        config.exit_code = job.exit_code;
        config.error = job.error.clone();
        config.started_at = Some(job.started_at);
        config.completed_at = job.completed_at;
        write_config(&self.config_path(), &config).await
    }

    /// 以追加方式打开输出日志
    pub async fn open_log(&self) -> FleetResult<fs::File> {
        Ok(fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?)
    }
}

async fn read_config(path: &Path) -> FleetResult<Option<JobConfig>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_config(path: &Path, config: &JobConfig) -> FleetResult<()> {
    let body = serde_json::to_vec_pretty(config)?;
    // 先写临时文件再重命名，避免读到半截内容
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// 共享作业目录
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_id(job_id: &str) -> FleetResult<()> {
        if job_id.is_empty()
            || job_id == "."
            || job_id == ".."
            || job_id.contains(['/', '\\'])
        {
            return Err(FleetError::invalid_params(format!("无效的 jobId: {job_id}")));
        }
        Ok(())
    }

    /// 定位作业目录并确认 run.sh 存在
    pub async fn resolve(&self, job_id: &str, job_path: Option<&str>) -> FleetResult<JobDir> {
        Self::validate_id(job_id)?;
        let dir = match job_path {
            Some(path) => PathBuf::from(path),
            None => self.root.join(job_id),
        };
        let job = JobDir {
            job_id: job_id.to_string(),
            dir,
        };
        match fs::metadata(job.script()).await {
            Ok(meta) if meta.is_file() => Ok(job),
            _ => Err(FleetError::invalid_params(format!(
                "作业脚本不存在: {}",
                job.script().display()
            ))),
        }
    }

    /// 从文件系统恢复作业结果；目录或 job.json 不存在时返回 `None`
    pub async fn load_snapshot(&self, job_id: &str) -> Option<RemoteJob> {
        Self::validate_id(job_id).ok()?;
        let job = JobDir {
            job_id: job_id.to_string(),
            dir: self.root.join(job_id),
        };
        let config = match read_config(&job.config_path()).await {
            Ok(Some(config)) => config,
            Ok(None) => return None,
            Err(e) => {
                debug!(job_id = %job_id, "读取 job.json 失败: {e}");
                return None;
            }
        };
        let status = config.status?;
        let stdout = fs::read_to_string(job.log_path()).await.unwrap_or_default();
        Some(RemoteJob {
            id: job_id.to_string(),
            command: None,
            args: Vec::new(),
            job_id: Some(job_id.to_string()),
            status,
            started_at: config.started_at.unwrap_or_else(Utc::now),
            completed_at: config.completed_at,
            exit_code: config.exit_code,
            stdout,
            stderr: String::new(),
            error: config.error,
        })
    }

    /// 启动时把仍标记为 running 的作业改为 failed
    pub async fn recover(&self) -> FleetResult<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(JOB_CONFIG);
            let mut config = match read_config(&path).await {
                Ok(Some(config)) => config,
                Ok(None) => continue,
                Err(e) => {
                    warn!("跳过无法解析的 {}: {e}", path.display());
                    continue;
                }
            };
            if config.status != Some(RemoteJobStatus::Running) {
                continue;
            }
            config.status = Some(RemoteJobStatus::Failed);
            config.error = Some(RESTART_ERROR.to_string());
            config.completed_at = Some(Utc::now());
            write_config(&path, &config).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!("{recovered} 个中断的作业已标记为失败");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_job(root: &Path, id: &str, config: serde_json::Value) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(JOB_SCRIPT), "echo hi\n").await.unwrap();
        fs::write(dir.join(JOB_CONFIG), config.to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_requires_script() {
        let root = tempfile::tempdir().unwrap();
        let store = JobStore::new(root.path());
        fs::create_dir_all(root.path().join("empty")).await.unwrap();

        assert!(matches!(
            store.resolve("empty", None).await,
            Err(FleetError::InvalidParams(_))
        ));
        assert!(store.resolve("../etc", None).await.is_err());

        write_job(root.path(), "job-1", json!({})).await;
        let job = store.resolve("job-1", None).await.unwrap();
        assert_eq!(job.script(), root.path().join("job-1").join(JOB_SCRIPT));
    }

    #[tokio::test]
    async fn test_write_status_keeps_unknown_fields() {
        let root = tempfile::tempdir().unwrap();
        let store = JobStore::new(root.path());
        write_job(
            root.path(),
            "job-2",
            json!({"env": {"A": "1"}, "pipeline": "build"}),
        )
        .await;
        let dir = store.resolve("job-2", None).await.unwrap();

        let job = RemoteJob {
            id: "job-2".into(),
            command: None,
            args: vec![],
            job_id: Some("job-2".into()),
            status: RemoteJobStatus::Completed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        };
        dir.write_status(&job).await.unwrap();

        let config = dir.load_config().await.unwrap();
        assert_eq!(config.status, Some(RemoteJobStatus::Completed));
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.extra.get("pipeline"), Some(&json!("build")));
    }

    #[tokio::test]
    async fn test_recover_marks_running_jobs_failed() {
        let root = tempfile::tempdir().unwrap();
        let store = JobStore::new(root.path());
        write_job(root.path(), "stuck", json!({"status": "running"})).await;
        write_job(root.path(), "done", json!({"status": "completed", "exitCode": 0})).await;

        assert_eq!(store.recover().await.unwrap(), 1);

        let stuck = store.load_snapshot("stuck").await.unwrap();
        assert_eq!(stuck.status, RemoteJobStatus::Failed);
        assert_eq!(stuck.error.as_deref(), Some(RESTART_ERROR));
        let done = store.load_snapshot("done").await.unwrap();
        assert_eq!(done.status, RemoteJobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_recover_missing_root_is_noop() {
        let store = JobStore::new("/definitely/not/here");
        assert_eq!(store.recover().await.unwrap(), 0);
        assert!(store.load_snapshot("x").await.is_none());
    }
}
