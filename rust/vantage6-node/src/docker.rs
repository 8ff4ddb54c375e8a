//! A [`ContainerBackend`] that drives the `docker` command line.
//!
//! Every run gets a directory below the task directory holding its input,
//! output and token files, and a fresh data volume named after the run id.
//! The container is attached to the isolated network only and reaches the
//! server through the proxy.

use std::{
    collections::HashMap,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{
    fs,
    process::Command,
    sync::{mpsc, Mutex},
};
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

use crate::{
    backend::{BackendError, Completion, ContainerBackend, ContainerRun},
    settings::DockerSettings,
};

const INPUT_FILE: &str = "input";
const OUTPUT_FILE: &str = "output";
const TOKEN_FILE: &str = "token";
const TASK_MOUNT: &str = "/mnt/task";
const DATA_MOUNT: &str = "/mnt/data";

#[derive(Debug, Clone)]
struct Docker {
    binary: PathBuf,
}

impl Docker {
    async fn exec<I, S>(&self, args: I) -> Result<String, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let command = args
                .iter()
                .map(|arg| arg.as_ref().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            Err(BackendError::Command {
                command: format!("docker {}", command),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

pub fn volume_name(run_id: u64) -> String {
    format!("vantage6-run-{}", run_id)
}

pub fn container_name(result_id: u64) -> String {
    format!("vantage6-result-{}", result_id)
}

pub struct DockerBackend {
    docker: Docker,
    settings: DockerSettings,
    proxy_host: String,
    /// Container names by result id.
    running: Arc<Mutex<HashMap<u64, String>>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl DockerBackend {
    pub fn new(
        settings: DockerSettings,
        proxy_host: String,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            docker: Docker {
                binary: settings.docker.clone(),
            },
            settings,
            proxy_host,
            running: Arc::new(Mutex::new(HashMap::new())),
            completions,
        }
    }

    fn run_dir(&self, run_id: u64) -> PathBuf {
        self.settings.task_dir.join(format!("run_{}", run_id))
    }

    /// Writes the files the algorithm reads, and an empty output file.
    async fn prepare_files(&self, run: &ContainerRun) -> Result<PathBuf, BackendError> {
        let dir = self.run_dir(run.run_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(INPUT_FILE), &run.input).await?;
        fs::write(dir.join(TOKEN_FILE), &run.token).await?;
        fs::write(dir.join(OUTPUT_FILE), b"").await?;
        Ok(dir)
    }

    fn run_args(&self, run: &ContainerRun, dir: &Path) -> Vec<String> {
        let env = [
            ("INPUT_FILE", format!("{}/{}", TASK_MOUNT, INPUT_FILE)),
            ("OUTPUT_FILE", format!("{}/{}", TASK_MOUNT, OUTPUT_FILE)),
            ("TOKEN_FILE", format!("{}/{}", TASK_MOUNT, TOKEN_FILE)),
            ("DATABASE_URI", run.database_uri.clone()),
            ("HOST", self.proxy_host.clone()),
        ];
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            container_name(run.result_id),
            "--network".to_string(),
            self.settings.network.clone(),
            "--volume".to_string(),
            format!("{}:{}", volume_name(run.run_id), DATA_MOUNT),
            "--volume".to_string(),
            format!("{}:{}", dir.display(), TASK_MOUNT),
        ];
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(run.task.image.clone());
        args
    }

    /// Creates the volume and starts the container. Pulling the image may
    /// take a while, the map of running containers stays unlocked meanwhile.
    async fn start(&self, run: &ContainerRun) -> Result<PathBuf, BackendError> {
        let dir = self.prepare_files(run).await?;
        let volume = volume_name(run.run_id);
        self.docker.exec(["volume", "create", volume.as_str()]).await?;
        let id = self.docker.exec(self.run_args(run, &dir)).await?;
        debug!("started container {} for result {}", id, run.result_id);
        Ok(dir)
    }

    /// Waits for the container to exit and reports its outcome.
    async fn watch(
        docker: Docker,
        running: Arc<Mutex<HashMap<u64, String>>>,
        completions: mpsc::UnboundedSender<Completion>,
        run: ContainerRun,
        dir: PathBuf,
    ) {
        let name = container_name(run.result_id);
        let status_code = match docker.exec(["wait", name.as_str()]).await {
            Ok(status) => status.parse().unwrap_or_else(|_| {
                warn!("unexpected exit status {}", status);
                -1
            }),
            Err(e) => {
                error!("failed to wait for the container: {}", e);
                -1
            }
        };
        let log = match docker.exec(["logs", name.as_str()]).await {
            Ok(log) => log,
            Err(e) => {
                warn!("failed to read the container logs: {}", e);
                String::new()
            }
        };
        let output = match fs::read(dir.join(OUTPUT_FILE)).await {
            Ok(output) => output,
            Err(e) => {
                warn!("failed to read the output: {}", e);
                Vec::new()
            }
        };
        if let Err(e) = docker.exec(["rm", name.as_str()]).await {
            warn!("failed to remove the container: {}", e);
        }
        running.lock().await.remove(&run.result_id);

        info!("container exited with status {}", status_code);
        let completion = Completion {
            result_id: run.result_id,
            task_id: run.task.id,
            run_id: run.run_id,
            status_code,
            output,
            log,
        };
        if completions.send(completion).is_err() {
            error!("the result of the run is lost: the reporter stopped");
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn run(&self, run: ContainerRun) -> Result<(), BackendError> {
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&run.result_id) {
                info!("result {} is running already", run.result_id);
                return Ok(());
            }
            running.insert(run.result_id, container_name(run.result_id));
        }

        let dir = match self.start(&run).await {
            Ok(dir) => dir,
            Err(e) => {
                self.running.lock().await.remove(&run.result_id);
                return Err(e);
            }
        };

        let span = tracing::info_span!("container", result_id = run.result_id);
        tokio::spawn(
            Self::watch(
                self.docker.clone(),
                self.running.clone(),
                self.completions.clone(),
                run,
                dir,
            )
            .instrument(span),
        );
        Ok(())
    }

    async fn kill(&self, result_id: u64) -> bool {
        let name = match self.running.lock().await.get(&result_id) {
            Some(name) => name.clone(),
            None => return false,
        };
        match self.docker.exec(["kill", name.as_str()]).await {
            Ok(_) => {
                info!("killed the container of result {}", result_id);
                true
            }
            Err(e) => {
                warn!("failed to kill the container of result {}: {}", result_id, e);
                false
            }
        }
    }

    async fn kill_all(&self) -> usize {
        let ids: Vec<u64> = self.running.lock().await.keys().copied().collect();
        let mut killed = 0;
        for id in ids {
            if self.kill(id).await {
                killed += 1;
            }
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vantage6_core::TaskRef;

    use super::*;

    fn backend(task_dir: &Path) -> DockerBackend {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = DockerSettings {
            task_dir: task_dir.to_path_buf(),
            ..DockerSettings::default()
        };
        DockerBackend::new(settings, "http://proxy:7654".to_string(), tx)
    }

    /// A backend driving a `docker` stand-in script that runs `body` for
    /// every invocation.
    #[cfg(unix)]
    fn scripted_backend(dir: &Path, body: &str) -> (DockerBackend, mpsc::UnboundedReceiver<Completion>) {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("docker");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = DockerSettings {
            task_dir: dir.join("tasks"),
            docker: script,
            ..DockerSettings::default()
        };
        (DockerBackend::new(settings, "http://proxy:7654".to_string(), tx), rx)
    }

    fn container_run() -> ContainerRun {
        ContainerRun {
            result_id: 8,
            run_id: 21,
            task: TaskRef {
                id: 42,
                image: "harbor/average".to_string(),
                collaboration_id: 1,
                job_id: 42,
                parent_id: None,
            },
            token: "container-token".to_string(),
            database_uri: "/data/default.csv".to_string(),
            input: b"{\"method\": \"average\"}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_prepare_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let run_dir = backend.prepare_files(&container_run()).await.unwrap();

        assert_eq!(run_dir, dir.path().join("run_21"));
        assert_eq!(
            std::fs::read(run_dir.join(INPUT_FILE)).unwrap(),
            b"{\"method\": \"average\"}"
        );
        assert_eq!(
            std::fs::read_to_string(run_dir.join(TOKEN_FILE)).unwrap(),
            "container-token"
        );
        assert!(std::fs::read(run_dir.join(OUTPUT_FILE)).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_does_not_wait_for_a_starting_container() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, mut completions) = scripted_backend(
            dir.path(),
            r#"case "$1" in
  run) sleep 2; echo container-id ;;
  wait) echo 137 ;;
esac"#,
        );
        let backend = Arc::new(backend);

        let starting = backend.clone();
        let run = tokio::spawn(async move { starting.run(container_run()).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        let killed = tokio::time::timeout(Duration::from_secs(1), backend.kill(8)).await;
        assert_eq!(killed.ok(), Some(true));

        run.await.unwrap().unwrap();
        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.result_id, 8);
        assert_eq!(completion.status_code, 137);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _completions) = scripted_backend(
            dir.path(),
            r#"case "$1" in
  run) echo "pull access denied" >&2; exit 125 ;;
esac"#,
        );

        let err = backend.run(container_run()).await.unwrap_err();
        assert!(matches!(err, BackendError::Command { status: 125, .. }));
        assert!(!backend.kill(8).await);
        assert_eq!(backend.kill_all().await, 0);
    }

    #[test]
    fn test_run_args() {
        let backend = backend(Path::new("/tasks"));
        let args = backend.run_args(&container_run(), Path::new("/tasks/run_21"));

        assert_eq!(args[..4], ["run", "--detach", "--name", "vantage6-result-8"]);
        let joined = args.join(" ");
        assert!(joined.contains("--network vantage6-isolated"));
        assert!(joined.contains("--volume vantage6-run-21:/mnt/data"));
        assert!(joined.contains("--volume /tasks/run_21:/mnt/task"));
        assert!(joined.contains("--env DATABASE_URI=/data/default.csv"));
        assert!(joined.contains("--env HOST=http://proxy:7654"));
        assert_eq!(args.last().unwrap(), "harbor/average");
    }
}
