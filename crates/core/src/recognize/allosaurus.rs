use super::{PhoneRecognizer, PhoneticString, RecognitionError, RecognizerFactory, RecognizerInitError};
use crate::config::{LanguageCode, RecognizerConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Exit status the worker uses for a missing package, as opposed to a model
/// that will not load.
const WORKER_MISSING_PACKAGE: i32 = 3;

/// Printed once the model is resident and requests may be sent.
const READY: &str = "READY";

/// Lines of worker stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the rest of stderr after the worker died during startup.
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Loads the model once, then answers `<path>\t<lang>` lines with
/// `OK\t<phones>` or `ERR\t<message>`.
const WORKER_SCRIPT: &str = "\
import sys
try:
    from allosaurus.app import read_recognizer
except ImportError as e:
    print(e, file=sys.stderr)
    sys.exit(3)
model = read_recognizer(*sys.argv[1:])
print('READY', flush=True)
for line in sys.stdin:
    path, _, lang = line.rstrip('\\n').partition('\\t')
    try:
        phones = ' '.join(str(model.recognize(path, lang)).split())
        print('OK\\t' + phones, flush=True)
    except Exception as e:
        print('ERR\\t' + ' '.join(str(e).split()), flush=True)
";

#[derive(Clone, Debug)]
struct Launch {
    python: PathBuf,
    model: Option<String>,
    timeout: Duration,
}

/// Brings up the Allosaurus universal phone recognizer in a resident Python worker.
#[derive(Clone, Debug)]
pub struct AllosaurusFactory {
    config: RecognizerConfig,
}

impl AllosaurusFactory {
    #[must_use]
    pub fn new(config: RecognizerConfig) -> Self {
        Self { config }
    }
}

impl RecognizerFactory for AllosaurusFactory {
    fn initialize(&self) -> BoxFuture<'_, Result<Arc<dyn PhoneRecognizer>, RecognizerInitError>> {
        let launch = Launch {
            python: self.config.python.clone(),
            model: self.config.model.clone(),
            timeout: self.config.timeout(),
        };

        async move {
            let worker = Worker::spawn(&launch).await?;
            Ok(Arc::new(AllosaurusRecognizer {
                launch,
                worker: Mutex::new(Some(worker)),
            }) as Arc<dyn PhoneRecognizer>)
        }
        .boxed()
    }
}

/// Owns the worker process; one request at a time.
///
/// A worker that times out, dies, or is abandoned mid-request is killed. The
/// next request starts a fresh one.
pub struct AllosaurusRecognizer {
    launch: Launch,
    worker: Mutex<Option<Worker>>,
}

impl PhoneRecognizer for AllosaurusRecognizer {
    fn recognize(
        &self,
        audio: PathBuf,
        hint: LanguageCode,
    ) -> BoxFuture<'_, Result<PhoneticString, RecognitionError>> {
        async move {
            let request = request_line(&audio, hint)?;
            let mut slot = self.worker.lock().await;
            let mut worker = match slot.take() {
                Some(worker) => worker,
                None => {
                    tracing::warn!(python = %self.launch.python.display(), "restarting recognizer worker");
                    Worker::spawn(&self.launch).await?
                }
            };

            match tokio::time::timeout(self.launch.timeout, worker.request(&request)).await {
                Ok(Ok(phones)) => {
                    *slot = Some(worker);
                    Ok(phones)
                }
                Ok(Err(e @ RecognitionError::Rejected(_))) => {
                    *slot = Some(worker);
                    Err(e)
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "recognizer worker failed, discarding it");
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!(timeout = ?self.launch.timeout, "recognizer worker timed out, killing it");
                    Err(RecognitionError::TimedOut(self.launch.timeout))
                }
            }
        }
        .boxed()
    }

    fn is_reentrant(&self) -> bool {
        false
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: StderrTail,
}

impl Worker {
    /// Starts the interpreter and waits until the model is loaded.
    async fn spawn(launch: &Launch) -> Result<Self, RecognizerInitError> {
        let mut command = Command::new(&launch.python);
        command.arg("-c").arg(WORKER_SCRIPT);
        if let Some(model) = &launch.model {
            command.arg(model);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            RecognizerInitError::Unavailable(format!("failed to start {}: {e}", launch.python.display()))
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RecognizerInitError::Unavailable("worker stdio was not captured".into()));
        };

        let tail = StderrTail::default();
        let drain = tokio::spawn(tail.clone().drain(stderr));
        let mut stdout = BufReader::new(stdout).lines();

        match tokio::time::timeout(launch.timeout, wait_ready(&mut stdout)).await {
            Err(_) => Err(RecognizerInitError::TimedOut(launch.timeout)),
            Ok(true) => {
                tracing::debug!(pid = ?child.id(), "recognizer worker ready");
                Ok(Self {
                    child,
                    stdin,
                    stdout,
                    stderr: tail,
                })
            }
            Ok(false) => {
                let status = tokio::time::timeout(launch.timeout, child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                let _ = tokio::time::timeout(STDERR_GRACE, drain).await;
                let stderr = tail.text();
                Err(match status.and_then(|s| s.code()) {
                    Some(WORKER_MISSING_PACKAGE) => RecognizerInitError::Unavailable(format!(
                        "{} cannot import allosaurus: {stderr}",
                        launch.python.display()
                    )),
                    _ => RecognizerInitError::ModelLoad(format!(
                        "model {}: {stderr}",
                        launch.model.as_deref().unwrap_or("latest")
                    )),
                })
            }
        }
    }

    async fn request(&mut self, line: &str) -> Result<PhoneticString, RecognitionError> {
        if self.stdin.write_all(line.as_bytes()).await.is_err() || self.stdin.flush().await.is_err() {
            return Err(self.exited());
        }
        loop {
            let Some(reply) = self.stdout.next_line().await.map_err(RecognitionError::Io)? else {
                return Err(self.exited());
            };
            match parse_reply(&reply) {
                Some(outcome) => return outcome,
                None => tracing::debug!(line = %reply, "recognizer worker output"),
            }
        }
    }

    fn exited(&mut self) -> RecognitionError {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => "closed its pipes".to_owned(),
        };
        RecognitionError::Failed {
            status,
            stderr: self.stderr.text(),
        }
    }
}

/// Skips library chatter until the ready marker. False if stdout closed first.
async fn wait_ready(stdout: &mut Lines<BufReader<ChildStdout>>) -> bool {
    while let Ok(Some(line)) = stdout.next_line().await {
        if line.trim() == READY {
            return true;
        }
        tracing::debug!(line = %line, "recognizer worker output");
    }
    false
}

fn request_line(audio: &Path, hint: LanguageCode) -> Result<String, RecognitionError> {
    match audio.to_str() {
        Some(path) if !path.contains(['\t', '\n', '\r']) => Ok(format!("{path}\t{}\n", hint.as_str())),
        _ => Err(RecognitionError::UnsupportedPath(audio.to_path_buf())),
    }
}

/// `None` for lines that are not a reply.
fn parse_reply(line: &str) -> Option<Result<PhoneticString, RecognitionError>> {
    let (kind, rest) = line.split_once('\t').unwrap_or((line, ""));
    match kind {
        "OK" => Some(Ok(PhoneticString::parse(rest))),
        "ERR" => Some(Err(RecognitionError::Rejected(rest.trim().to_owned()))),
        _ => None,
    }
}

/// Last lines the worker wrote to stderr; everything is also logged.
#[derive(Clone, Debug, Default)]
struct StderrTail(Arc<std::sync::Mutex<VecDeque<String>>>);

impl StderrTail {
    async fn drain(self, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "recognizer worker stderr");
            if let Ok(mut tail) = self.0.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }

    fn text(&self) -> String {
        match self.0.lock() {
            Ok(tail) => tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n").trim().to_owned(),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_told_apart_from_chatter() {
        let ok = parse_reply("OK\th  ə l oʊ ").expect("reply").expect("phones");
        assert_eq!(ok.to_string(), "h ə l oʊ");
        assert!(parse_reply("OK\t").expect("reply").expect("phones").is_empty());
        match parse_reply("ERR\tcannot read wav ") {
            Some(Err(RecognitionError::Rejected(msg))) => assert_eq!(msg, "cannot read wav"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_reply("loading model eng2102").is_none());
        assert!(parse_reply("OKAY\tnope").is_none());
    }

    #[test]
    fn request_line_carries_path_and_language() {
        let line = request_line(Path::new("/tmp/a b.wav"), LanguageCode::Cmn).expect("line");
        assert_eq!(line, "/tmp/a b.wav\tcmn\n");
        let err = request_line(Path::new("/tmp/a\tb.wav"), LanguageCode::Eng).unwrap_err();
        assert!(matches!(err, RecognitionError::UnsupportedPath(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_interpreter_is_unavailable() {
        let factory = AllosaurusFactory::new(RecognizerConfig {
            python: PathBuf::from("/nonexistent/python-for-linguaphon"),
            model: None,
            timeout_secs: 5,
        });
        let err = factory.initialize().await.err().expect("init must fail");
        assert!(matches!(err, RecognizerInitError::Unavailable(_)), "{err}");
    }

    #[cfg(unix)]
    mod stand_in {
        use super::*;
        use crate::recognize::RecognizerResource;
        use std::os::unix::fs::PermissionsExt;

        /// Every start is logged to `starts.txt` and its arguments to `argv.txt`.
        const LOGGING: &str = r#"here="$(dirname "$0")"
echo start >> "$here/starts.txt"
printf '%s\n' "$@" > "$here/argv.txt""#;

        /// Writes an executable shell script that plays the Python interpreter.
        fn fake_python(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("python");
            std::fs::write(&path, format!("#!/bin/sh\n{LOGGING}\n{body}\n")).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
            path
        }

        fn config(python: PathBuf, timeout_secs: u64) -> RecognizerConfig {
            RecognizerConfig {
                python,
                model: Some("eng2102".into()),
                timeout_secs,
            }
        }

        fn starts(dir: &Path) -> usize {
            std::fs::read_to_string(dir.join("starts.txt"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        const SERVE: &str = r#"echo "loading model"
echo READY
while IFS="$(printf '\t')" read -r path lang; do
  printf '%s %s\n' "$path" "$lang" >> "$here/requests.txt"
  printf 'OK\t t ɛ s t \n'
done"#;

        #[tokio::test]
        async fn model_is_loaded_once_for_many_requests() {
            let dir = tempfile::tempdir().expect("tempdir");
            let python = fake_python(dir.path(), SERVE);
            let resource = RecognizerResource::new(AllosaurusFactory::new(config(python, 10)));

            let langs = [LanguageCode::Eng, LanguageCode::Fra, LanguageCode::Jpn];
            for (i, lang) in langs.into_iter().enumerate() {
                let audio = dir.path().join(format!("clip{i}.wav"));
                let phones = resource.recognize(&audio, lang).await.expect("recognized");
                assert_eq!(phones.to_string(), "t ɛ s t");
            }
            assert_eq!(starts(dir.path()), 1);

            let requests = std::fs::read_to_string(dir.path().join("requests.txt")).expect("requests");
            let requests: Vec<&str> = requests.lines().collect();
            assert_eq!(requests.len(), 3);
            assert!(requests[1].ends_with("clip1.wav fra"), "{}", requests[1]);

            let argv = std::fs::read_to_string(dir.path().join("argv.txt")).expect("argv");
            assert_eq!(argv.lines().next(), Some("-c"));
            assert_eq!(argv.lines().last(), Some("eng2102"));
        }

        #[tokio::test]
        async fn rejected_request_keeps_the_worker() {
            let dir = tempfile::tempdir().expect("tempdir");
            let python = fake_python(
                dir.path(),
                r#"echo READY
while IFS="$(printf '\t')" read -r path lang; do
  case "$path" in
    *bad.wav) printf 'ERR\tcannot decode %s\n' "$path" ;;
    *) printf 'OK\ta\n' ;;
  esac
done"#,
            );
            let recognizer = AllosaurusFactory::new(config(python, 10))
                .initialize()
                .await
                .expect("init");
            assert!(!recognizer.is_reentrant());

            let err = recognizer
                .recognize(dir.path().join("bad.wav"), LanguageCode::Eng)
                .await
                .unwrap_err();
            assert!(matches!(err, RecognitionError::Rejected(ref m) if m.contains("cannot decode")), "{err}");
            let phones = recognizer
                .recognize(dir.path().join("good.wav"), LanguageCode::Eng)
                .await
                .expect("recognized");
            assert_eq!(phones.to_string(), "a");
            assert_eq!(starts(dir.path()), 1);
        }

        #[tokio::test]
        async fn dead_worker_is_reported_then_restarted() {
            let dir = tempfile::tempdir().expect("tempdir");
            // The first worker dies on its first request, later ones serve.
            let python = fake_python(
                dir.path(),
                r#"echo READY
if [ "$(wc -l < "$here/starts.txt")" -eq 1 ]; then
  read -r _
  echo 'segmentation fault' >&2
  exit 139
fi
while read -r _; do printf 'OK\tb\n'; done"#,
            );
            let recognizer = AllosaurusFactory::new(config(python, 10))
                .initialize()
                .await
                .expect("init");

            let err = recognizer
                .recognize(dir.path().join("x.wav"), LanguageCode::Eng)
                .await
                .unwrap_err();
            assert!(matches!(err, RecognitionError::Failed { .. }), "{err}");

            let phones = recognizer
                .recognize(dir.path().join("x.wav"), LanguageCode::Eng)
                .await
                .expect("recognized after restart");
            assert_eq!(phones.to_string(), "b");
            assert_eq!(starts(dir.path()), 2);
        }

        #[tokio::test]
        async fn missing_package_maps_to_unavailable() {
            let dir = tempfile::tempdir().expect("tempdir");
            let python = fake_python(dir.path(), "echo 'No module named allosaurus' >&2; exit 3");
            let err = AllosaurusFactory::new(config(python, 10))
                .initialize()
                .await
                .err()
                .expect("init must fail");
            match err {
                RecognizerInitError::Unavailable(msg) => assert!(msg.contains("No module named")),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn broken_model_maps_to_model_load() {
            let dir = tempfile::tempdir().expect("tempdir");
            let python = fake_python(dir.path(), "echo 'corrupt weights' >&2; exit 1");
            let err = AllosaurusFactory::new(config(python, 10))
                .initialize()
                .await
                .err()
                .expect("init must fail");
            match err {
                RecognizerInitError::ModelLoad(msg) => assert!(msg.contains("corrupt weights"), "{msg}"),
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn stalled_request_times_out() {
            let dir = tempfile::tempdir().expect("tempdir");
            let python = fake_python(dir.path(), "echo READY\nread -r _\nexec sleep 30");
            let recognizer = AllosaurusFactory::new(config(python, 1))
                .initialize()
                .await
                .expect("init");
            let err = recognizer
                .recognize(dir.path().join("x.wav"), LanguageCode::Eng)
                .await
                .unwrap_err();
            assert!(matches!(err, RecognitionError::TimedOut(_)), "{err}");
        }
    }
}
