use super::{RenderBackend, RenderRequest, SynthesisError};
use crate::config::RendererConfig;
use crate::recognize::PhoneticString;
use crate::util::{run_with_timeout, stderr_text, ProcessError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Wraps phones in the `[[ ]]` phoneme-input delimiters.
///
/// The renderer runs in markup mode (`-m`), so markup metacharacters are
/// escaped and stray brackets are dropped; neither can end the phoneme span
/// early or be read as markup.
pub fn quote_phonemes(phonetic: &PhoneticString) -> String {
    let text = phonetic.to_string();
    let mut out = String::with_capacity(text.len() + 4);
    out.push_str("[[");
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '[' | ']' => {}
            c => out.push(c),
        }
    }
    out.push_str("]]");
    out
}

/// eSpeak NG invoked as `espeak-ng -m -v <voice> -w <out> "[[phones]]"`.
#[derive(Clone, Debug)]
pub struct EspeakRenderer {
    binary: PathBuf,
    timeout: Duration,
}

impl EspeakRenderer {
    #[must_use]
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.timeout(),
        }
    }

    fn args(request: &RenderRequest) -> Vec<OsString> {
        vec![
            "-m".into(),
            "-v".into(),
            request.voice.as_str().into(),
            "-w".into(),
            request.output.clone().into_os_string(),
            quote_phonemes(&request.phonetic).into(),
        ]
    }
}

impl RenderBackend for EspeakRenderer {
    fn render(&self, request: RenderRequest) -> BoxFuture<'_, Result<(), SynthesisError>> {
        async move {
            let mut command = Command::new(&self.binary);
            command.args(Self::args(&request));

            let output = run_with_timeout(command, self.timeout).await.map_err(|e| match e {
                ProcessError::TimedOut { timeout, .. } => SynthesisError::TimedOut(timeout),
                other => SynthesisError::Spawn(other.to_string()),
            })?;

            if !output.status.success() {
                return Err(SynthesisError::Failed {
                    status: output.status.to_string(),
                    stderr: stderr_text(&output),
                });
            }
            Ok(())
        }
        .boxed()
    }
}
