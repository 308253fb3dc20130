//! Cloud-init provisioning document builder.
//!
//! The document is assembled programmatically and rendered as YAML behind
//! the `#cloud-config` marker line that first-boot agents look for.
//! Cloud backends receive the rendered bytes opaquely and must not
//! interpret them.

use serde::Serialize;
use thiserror::Error;

const MARKER: &str = "#cloud-config";

/// Errors raised while rendering a cloud-config document.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when YAML serialisation fails.
    #[error("failed to render cloud-config: {0}")]
    Render(String),
}

/// A user to create at first boot.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct User {
    /// Login name.
    pub name: String,
    /// Comma-separated supplementary groups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<String>,
    /// Login shell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Sudoers rule granted to the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,
    /// Public keys installed into the user's authorized keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
    /// Hashed password, if password login is wanted.
    #[serde(rename = "passwd", skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

/// A file to write at first boot.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WriteFile {
    /// Absolute path of the file.
    pub path: String,
    /// File content.
    pub content: String,
    /// Owner, as `user:group`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Octal permission string, for example `"0644"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// Content encoding, for example `"b64"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// The cloud-config document.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<User>,
    #[serde(rename = "runcmd", skip_serializing_if = "Vec::is_empty")]
    run_commands: Vec<Vec<String>>,
    #[serde(rename = "bootcmd", skip_serializing_if = "Vec::is_empty")]
    boot_commands: Vec<String>,
    #[serde(rename = "write_files", skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFile>,
}

impl CloudConfig {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instance hostname.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    /// Adds top-level authorized keys.
    pub fn add_ssh_authorized_keys(&mut self, keys: impl IntoIterator<Item = String>) {
        self.ssh_authorized_keys.extend(keys);
    }

    /// Adds a user.
    pub fn add_user(&mut self, user: User) {
        self.users.push(user);
    }

    /// Appends a command to run at first boot. Commands run in the order
    /// they were added.
    pub fn add_run_command(&mut self, command: Vec<String>) {
        self.run_commands.push(command);
    }

    /// Appends a `sh -c` command to run at first boot.
    pub fn add_shell_command(&mut self, command: impl Into<String>) {
        self.add_run_command(vec![
            String::from("sh"),
            String::from("-c"),
            command.into(),
        ]);
    }

    /// Appends a file to write at first boot.
    pub fn add_file(&mut self, file: WriteFile) {
        self.write_files.push(file);
    }

    /// Commands accumulated so far, in execution order.
    #[must_use]
    pub fn run_commands(&self) -> &[Vec<String>] {
        &self.run_commands
    }

    /// Renders the document as `#cloud-config` YAML bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CloudInitError::Render`] when serialisation fails.
    pub fn render(&self) -> Result<Vec<u8>, CloudInitError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|err| CloudInitError::Render(err.to_string()))?;
        Ok(format!("{MARKER}\n{yaml}").into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_to_string(config: &CloudConfig) -> String {
        let bytes = config.render().unwrap_or_else(|err| panic!("{err}"));
        String::from_utf8(bytes).unwrap_or_else(|err| panic!("{err}"))
    }

    #[test]
    fn render_starts_with_marker_line() {
        let rendered = render_to_string(&CloudConfig::new());
        assert!(rendered.starts_with("#cloud-config\n"), "got: {rendered}");
    }

    #[test]
    fn render_preserves_run_command_order() {
        let mut config = CloudConfig::new();
        config.add_shell_command("echo first");
        config.add_shell_command("echo second");
        config.add_shell_command("echo third");

        let rendered = render_to_string(&config);
        let first = rendered.find("echo first").unwrap_or_else(|| panic!("first missing"));
        let second = rendered.find("echo second").unwrap_or_else(|| panic!("second missing"));
        let third = rendered.find("echo third").unwrap_or_else(|| panic!("third missing"));
        assert!(first < second && second < third, "got: {rendered}");
    }

    #[test]
    fn render_includes_user_and_file_sections() {
        let mut config = CloudConfig::new();
        config.add_user(User {
            name: String::from("corral"),
            groups: Some(String::from("sudo")),
            shell: Some(String::from("/bin/bash")),
            sudo: Some(String::from("ALL=(ALL) NOPASSWD:ALL")),
            ssh_authorized_keys: vec![String::from("ssh-ed25519 AAAA test")],
            password_hash: None,
        });
        config.add_file(WriteFile {
            path: String::from("/etc/example.conf"),
            content: String::from("key=value"),
            ..WriteFile::default()
        });

        let rendered = render_to_string(&config);
        assert!(rendered.contains("users:"), "got: {rendered}");
        assert!(rendered.contains("ssh_authorized_keys:"), "got: {rendered}");
        assert!(rendered.contains("write_files:"), "got: {rendered}");
        assert!(rendered.contains("/etc/example.conf"), "got: {rendered}");
        assert!(!rendered.contains("passwd"), "got: {rendered}");
    }

    #[test]
    fn empty_sections_are_omitted() {
        let rendered = render_to_string(&CloudConfig::new());
        assert!(!rendered.contains("runcmd"), "got: {rendered}");
        assert!(!rendered.contains("users"), "got: {rendered}");
    }
}
