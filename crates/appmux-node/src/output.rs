use appmux_appd::RunningInstance;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

/// Re-emits the piped stdout and stderr of an instance as log records under
/// the `appd` target. The forwarding tasks end when the child closes its
/// pipes.
pub(crate) fn forward_output(instance: &mut RunningInstance) {
    let app_version = instance.app_version();
    if let Some(stdout) = instance.take_stdout() {
        tokio::spawn(forward_lines(stdout, app_version, Stream::Stdout));
    }
    if let Some(stderr) = instance.take_stderr() {
        tokio::spawn(forward_lines(stderr, app_version, Stream::Stderr));
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn forward_lines<R>(reader: R, app_version: u64, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                match stream {
                    Stream::Stdout => info!(target: "appd", app_version, "{text}"),
                    Stream::Stderr => warn!(target: "appd", app_version, "{text}"),
                }
            }
            Err(err) => {
                warn!(app_version, "stopped forwarding app output: {err}");
                break;
            }
        }
    }

    // The pipe stays open for as long as the child writes to it; a closed
    // read end would kill the app with SIGPIPE.
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
}
