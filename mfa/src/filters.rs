//! Filter plugin processes.
use std::process::Stdio;

use filter_api::{Channel, HookMask, TAG_REGISTER};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::envelope::FilterDef;
use crate::MfaError;

pub type FilterChannel = Channel<ChildStdout, ChildStdin>;

/// Starts the plugin described by `def`, talking to it over its stdin and
/// stdout. Its stderr is shared with the agent.
pub fn spawn_filter(def: &FilterDef) -> Result<(Child, FilterChannel), MfaError> {
    let spawn_error = |source| MfaError::FilterSpawn {
        name: def.name.clone(),
        source,
    };

    let mut child = Command::new(def.path.as_std_path())
        .args(&def.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(spawn_error(std::io::Error::other("missing stdio pipe")));
    };

    info!(filter = %def.name, path = %def.path, pid = child.id(), "started filter");
    Ok((child, Channel::new(stdout, stdin)))
}

/// Waits for the plugin's hook announcement, which must be its first message.
pub async fn await_registration<R, W>(
    name: &str,
    channel: &mut Channel<R, W>,
) -> Result<HookMask, MfaError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match channel.recv().await? {
        Some(frame) if frame.tag == TAG_REGISTER => Ok(HookMask::decode(&frame.payload)?),
        Some(frame) => Err(MfaError::NotRegistered {
            name: name.to_string(),
            tag: frame.tag,
        }),
        None => Err(MfaError::FilterExited(name.to_string())),
    }
}
