//! File system changes on a Linux host, reverted automatically.
//!
//! Every path touched by [`LinuxFileSystem`] is backed up first. Rollback
//! commands are kept in frames: the base frame is reverted on teardown and,
//! since the utility is reentrant, every enter opens a new frame that is
//! reverted by the matching exit. A host-owned instance therefore restores
//! the file system after every test and every topology.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::connection::{LogLevel, ProcessResult, RunOptions};
use crate::error::{Error, Result};
use crate::inventory::MultihostHost;
use crate::utility::{mark_used, Utility, UtilityState};

/// Ownership and access mode applied after a change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// `chmod` mode
    pub mode: Option<String>,
    /// `chown` user
    pub user: Option<String>,
    /// `chgrp` group
    pub group: Option<String>,
}

impl FileAttrs {
    /// Attributes with only a mode.
    pub fn mode(mode: impl Into<String>) -> Self {
        Self {
            mode: Some(mode.into()),
            ..Default::default()
        }
    }

    /// Sets the owner.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    fn commands(&self, path: &str) -> String {
        let mut cmds = Vec::new();
        if let Some(ref mode) = self.mode {
            cmds.push(format!("chmod '{mode}' '{path}'"));
        }
        if let Some(ref user) = self.user {
            cmds.push(format!("chown '{user}' '{path}'"));
        }
        if let Some(ref group) = self.group {
            cmds.push(format!("chgrp '{group}' '{path}'"));
        }
        cmds.join(" && ")
    }
}

fn attrs_commands(attrs: Option<&FileAttrs>, path: &str) -> String {
    attrs.map(|a| a.commands(path)).unwrap_or_default()
}

#[derive(Debug, Default)]
struct Frame {
    rollback: Vec<String>,
    backed_up: HashSet<String>,
}

impl Frame {
    fn revert_script(&self) -> String {
        self.rollback.iter().rev().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// File system operations on a remote Linux host.
#[derive(Debug)]
pub struct LinuxFileSystem {
    state: UtilityState,
    host: Arc<dyn MultihostHost>,
    frames: Mutex<Vec<Frame>>,
}

impl LinuxFileSystem {
    /// Creates the utility for `host`.
    pub fn new(host: Arc<dyn MultihostHost>) -> Self {
        let logger = host.base().logger().clone();
        Self {
            state: UtilityState::new("fs", logger).reentrant(),
            host,
            frames: Mutex::new(vec![Frame::default()]),
        }
    }

    /// Host the utility works on.
    pub fn host(&self) -> &Arc<dyn MultihostHost> {
        &self.host
    }

    fn hostname(&self) -> &str {
        self.host.hostname()
    }

    async fn run(&self, script: &str, input: Option<&str>) -> Result<ProcessResult> {
        let mut options = RunOptions::new().log_level(LogLevel::Error);
        if let Some(input) = input {
            options = options.input(input);
        }
        self.host.conn().run(script, options).await
    }

    fn push_rollback(&self, command: String) {
        if let Some(frame) = self.frames.lock().last_mut() {
            frame.rollback.push(command);
        }
    }

    async fn revert(&self, frame: Frame) -> Result<()> {
        let script = frame.revert_script();
        if script.is_empty() {
            return Ok(());
        }
        self.run(&script, None).await.map(|_| ())
    }

    /// Backs up `path` so that it is restored when the current frame is
    /// reverted. A path that does not exist is removed instead.
    ///
    /// Returns false if nothing was recorded.
    pub async fn backup(&self, path: &str) -> Result<bool> {
        mark_used(self).await?;
        let known = self
            .frames
            .lock()
            .last()
            .is_some_and(|f| f.backed_up.contains(path));
        if known {
            return Ok(true);
        }

        self.state.logger().info(format!("Creating a backup of \"{path}\" on {}", self.hostname()));
        let result = self
            .run(
                &format!(
                    r#"
set -e
if [ -f '{path}' ]; then
    tmp=`mktemp /tmp/mh.fs.rollback.XXXXXXXXX`
    cp --force --archive '{path}' "$tmp"
    echo "mv --force '$tmp' '{path}'"
elif [ -d '{path}' ]; then
    tmp=`mktemp -d /tmp/mh.fs.rollback.XXXXXXXXX`
    cp --force --archive '{path}/.' "$tmp"
    echo "rm --force --recursive '{path}' && mv --force '$tmp' '{path}'"
else
    echo "rm --force --recursive '{path}'"
fi
"#
                ),
                None,
            )
            .await?;

        let action = result.stdout().trim().to_string();
        if action.is_empty() {
            return Ok(false);
        }

        let mut frames = self.frames.lock();
        if let Some(frame) = frames.last_mut() {
            frame.rollback.push(action);
            frame.backed_up.insert(path.to_string());
        }
        Ok(true)
    }

    /// Creates a directory, replacing whatever is at `path`.
    pub async fn mkdir(&self, path: &str, attrs: Option<FileAttrs>) -> Result<()> {
        self.backup(path).await?;
        self.state.logger().info(format!("Creating directory \"{path}\" on {}", self.hostname()));
        self.run(
            &format!(
                "set -e\nrm -fr '{path}'\nmkdir '{path}'\n{}",
                attrs_commands(attrs.as_ref(), path)
            ),
            None,
        )
        .await?;
        Ok(())
    }

    /// Creates a directory and its missing parents.
    ///
    /// The topmost created parent is removed on rollback.
    pub async fn mkdir_p(&self, path: &str, attrs: Option<FileAttrs>) -> Result<()> {
        self.backup(path).await?;
        self.state
            .logger()
            .info(format!("Creating directory \"{path}\" (with parents) on {}", self.hostname()));
        let result = self
            .run(
                &format!(
                    "set -e\nrm -fr '{path}'\nLC_ALL=C mkdir -v -p '{path}' | head -1 | sed -E \"s/mkdir:[^']+'(.+)'$/\\1/\"\n{}",
                    attrs_commands(attrs.as_ref(), path)
                ),
                None,
            )
            .await?;

        let created = result.stdout().trim().to_string();
        if !created.is_empty() {
            self.push_rollback(format!("rm --force --recursive '{created}'"));
        }
        Ok(())
    }

    /// Creates a temporary file and returns its path.
    pub async fn mktmp(&self, contents: Option<&str>, attrs: Option<FileAttrs>) -> Result<String> {
        mark_used(self).await?;
        self.state.logger().info(format!("Creating temporary file on {}", self.hostname()));
        let result = self.run("mktemp /tmp/mh.fs.rollback.XXXXXXXXX", None).await?;
        let path = result.stdout().trim().to_string();
        if path.is_empty() {
            return Err(Error::Utility("Temporary file was not created".to_string()));
        }
        self.push_rollback(format!("rm --force '{path}'"));

        if let Some(contents) = contents {
            self.state.logger().info(format!("Writing file \"{path}\" on {}", self.hostname()));
            self.run(&format!("cat > '{path}'"), Some(contents)).await?;
        }

        let attrs = attrs_commands(attrs.as_ref(), &path);
        if !attrs.is_empty() {
            self.run(&attrs, None).await?;
        }
        Ok(path)
    }

    /// Reads a file.
    pub async fn read(&self, path: &str) -> Result<String> {
        mark_used(self).await?;
        self.state.logger().info(format!("Reading file \"{path}\" on {}", self.hostname()));
        let result = self
            .host
            .conn()
            .exec(&["cat", path], RunOptions::new().log_level(LogLevel::Error))
            .await?;
        Ok(result.stdout())
    }

    /// True if `path` exists.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        mark_used(self).await?;
        let result = self
            .host
            .conn()
            .exec(
                &["ls", path],
                RunOptions::new().log_level(LogLevel::Error).raise_on_error(false),
            )
            .await?;
        Ok(result.success())
    }

    /// Writes `contents` into `path`, replacing the file.
    pub async fn write(&self, path: &str, contents: &str, attrs: Option<FileAttrs>) -> Result<()> {
        self.backup(path).await?;
        self.state.logger().info(format!("Writing file \"{path}\" on {}", self.hostname()));
        self.run(
            &format!(
                "set -e\nrm -fr '{path}'\ncat > '{path}'\n{}",
                attrs_commands(attrs.as_ref(), path)
            ),
            Some(contents),
        )
        .await?;
        Ok(())
    }

    /// Appends `contents` to `path`.
    pub async fn append(&self, path: &str, contents: &str) -> Result<()> {
        self.backup(path).await?;
        self.state.logger().info(format!("Appending to file \"{path}\" on {}", self.hostname()));
        self.run(&format!("cat >> '{path}'"), Some(contents)).await?;
        Ok(())
    }

    /// Touches `path`.
    pub async fn touch(&self, path: &str, attrs: Option<FileAttrs>) -> Result<()> {
        self.backup(path).await?;
        self.state.logger().info(format!("Touching file \"{path}\" on {}", self.hostname()));
        self.run(
            &format!("set -e\ntouch '{path}'\n{}", attrs_commands(attrs.as_ref(), path)),
            None,
        )
        .await?;
        Ok(())
    }

    /// Truncates `path` to `size` bytes.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.backup(path).await?;
        self.state
            .logger()
            .info(format!("Truncating file \"{path}\" to {size} bytes on {}", self.hostname()));
        self.run(&format!("truncate -s '{size}' '{path}'"), None).await?;
        Ok(())
    }

    /// Uploads a local file to `remote_path`.
    pub async fn upload(&self, local_path: &Path, remote_path: &str, attrs: Option<FileAttrs>) -> Result<()> {
        self.backup(remote_path).await?;
        self.state.logger().info(format!(
            "Uploading file \"{}\" to \"{}:{remote_path}\"",
            local_path.display(),
            self.hostname()
        ));
        let encoded = STANDARD.encode(tokio::fs::read(local_path).await?);
        self.run(
            &format!(
                "set -e\nrm -fr '{remote_path}'\nbase64 --decode > '{remote_path}'\n{}",
                attrs_commands(attrs.as_ref(), remote_path)
            ),
            Some(&encoded),
        )
        .await?;
        Ok(())
    }

    /// Uploads a local file into a new temporary file and returns its path.
    pub async fn upload_to_tmp(&self, local_path: &Path, attrs: Option<FileAttrs>) -> Result<String> {
        let tmp = self.mktmp(None, attrs).await?;
        self.state.logger().info(format!(
            "Uploading file \"{}\" to \"{}:{tmp}\"",
            local_path.display(),
            self.hostname()
        ));
        let encoded = STANDARD.encode(tokio::fs::read(local_path).await?);
        self.run(&format!("base64 --decode > '{tmp}'"), Some(&encoded)).await?;
        Ok(tmp)
    }

    /// Downloads a remote file to `local_path`.
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        mark_used(self).await?;
        self.state.logger().info(format!(
            "Downloading file \"{remote_path}\" from {} to \"{}\"",
            self.hostname(),
            local_path.display()
        ));
        let result = self
            .host
            .conn()
            .exec(&["base64", remote_path], RunOptions::new().log_level(LogLevel::Error))
            .await?;
        let data = decode(&result)?;
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    /// Downloads files matching the glob patterns in `paths` as one gzipped
    /// tarball stored at `local_path`.
    pub async fn download_files(&self, paths: &[&str], local_path: &Path) -> Result<()> {
        mark_used(self).await?;
        self.state.logger().info(format!(
            "Downloading files from {} to \"{}\": {}",
            self.hostname(),
            local_path.display(),
            paths.join(", ")
        ));
        let globs: Vec<String> = paths.iter().map(|p| format!("$(compgen -G \"{p}\")")).collect();
        let result = self
            .run(
                &format!(
                    "tmp=`mktemp /tmp/mh.fs.download_files.XXXXXXXXX`\n\
                     tar -czvf \"$tmp\" {} &> /dev/null\n\
                     base64 \"$tmp\"\n\
                     rm -f \"$tmp\" &> /dev/null",
                    globs.join(" ")
                ),
                None,
            )
            .await?;
        let data = decode(&result)?;
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    /// Counts lines, words, bytes or characters of `path` with `wc`.
    pub async fn wc(&self, path: &str, lines: bool, words: bool, bytes: bool, chars: bool) -> Result<ProcessResult> {
        mark_used(self).await?;
        let mut argv = vec!["wc"];
        for (enabled, flag) in [(lines, "-l"), (words, "-w"), (bytes, "-c"), (chars, "-m")] {
            if enabled {
                argv.push(flag);
            }
        }
        argv.push(path);
        self.host.conn().exec(&argv, RunOptions::new()).await
    }
}

fn decode(result: &ProcessResult) -> Result<Vec<u8>> {
    let encoded: String = result.stdout_lines.concat();
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidValue(format!("Invalid base64 data: {e}")))
}

#[async_trait]
impl Utility for LinuxFileSystem {
    fn state(&self) -> &UtilityState {
        &self.state
    }

    async fn teardown(&self) -> Result<()> {
        let frames: Vec<Frame> = {
            let mut frames = self.frames.lock();
            let drained = frames.drain(..).collect();
            frames.push(Frame::default());
            drained
        };

        let script: Vec<String> = frames
            .iter()
            .rev()
            .map(Frame::revert_script)
            .filter(|s| !s.is_empty())
            .collect();
        if script.is_empty() {
            return Ok(());
        }
        self.run(&script.join("\n"), None).await.map(|_| ())
    }

    async fn enter(&self) -> Result<()> {
        self.frames.lock().push(Frame::default());
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        let frame = {
            let mut frames = self.frames.lock();
            if frames.len() > 1 {
                frames.pop()
            } else {
                None
            }
        };
        match frame {
            Some(frame) => self.revert(frame).await,
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;
    use crate::connection::local::LocalConnection;
    use crate::connection::Shell;
    use crate::inventory::{GenericHost, HostBase};
    use crate::logging::MultihostLogger;
    use crate::utility::{enter_utility, exit_utility, setup_utility, teardown_utility, with_utility};

    fn local_host() -> Arc<dyn MultihostHost> {
        let conn = Arc::new(LocalConnection::new("localhost", Shell::Bash, MultihostLogger::new()));
        Arc::new(GenericHost::new(HostBase::new("test", "localhost", "client", conn)))
    }

    #[test]
    fn test_attrs_commands() {
        let attrs = FileAttrs::mode("0600").user("root").group("wheel");
        assert_eq!(
            attrs.commands("/tmp/x"),
            "chmod '0600' '/tmp/x' && chown 'root' '/tmp/x' && chgrp 'wheel' '/tmp/x'"
        );
        assert_eq!(attrs_commands(None, "/tmp/x"), "");
    }

    #[tokio::test]
    async fn test_write_is_reverted_on_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("existing");
        let created = dir.path().join("created");
        std::fs::write(&existing, "original").unwrap();

        let fs = Arc::new(LinuxFileSystem::new(local_host()));
        with_utility(&fs, |fs| {
            let existing = existing.clone();
            let created = created.clone();
            async move {
                fs.write(existing.to_str().unwrap(), "changed", None).await?;
                fs.write(created.to_str().unwrap(), "new", None).await?;
                assert_eq!(fs.read(existing.to_str().unwrap()).await?, "changed");
                assert!(fs.exists(created.to_str().unwrap()).await?);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "original");
        assert!(!created.exists());
    }

    #[tokio::test]
    async fn test_exit_reverts_inner_frame_only() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = dir.path().join("inner");

        let fs = LinuxFileSystem::new(local_host());
        setup_utility(&fs).await.unwrap();
        fs.write(outer.to_str().unwrap(), "outer", None).await.unwrap();

        enter_utility(&fs, "test").await.unwrap();
        fs.write(inner.to_str().unwrap(), "inner", None).await.unwrap();
        fs.append(outer.to_str().unwrap(), "more").await.unwrap();
        exit_utility(&fs, "test").await.unwrap();

        assert!(!inner.exists());
        assert_eq!(std::fs::read_to_string(&outer).unwrap(), "outer");

        teardown_utility(&fs).await.unwrap();
        assert!(!outer.exists());
    }

    #[tokio::test]
    async fn test_mkdir_p_removes_created_parents() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("a");
        let nested = top.join("b").join("c");

        let fs = Arc::new(LinuxFileSystem::new(local_host()));
        with_utility(&fs, |fs| {
            let nested = nested.clone();
            async move { fs.mkdir_p(nested.to_str().unwrap(), None).await }
        })
        .await
        .unwrap();

        assert!(!top.exists());
    }
}
