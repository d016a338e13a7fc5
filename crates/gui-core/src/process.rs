//! External command execution
//!
//! Screen capture and input simulation are delegated to platform tools.
//! Commands are run without a shell: templates are split on whitespace,
//! honouring quotes, and placeholders are substituted per argument.

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// A command line with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    parts: Vec<String>,
}

impl CommandTemplate {
    /// Split on whitespace; single or double quotes group words into one argument
    pub fn parse(template: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut quote: Option<char> = None;

        for c in template.chars() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => current.push(c),
                None if c == '\'' || c == '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                None if c.is_whitespace() => {
                    if in_word {
                        parts.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                None => {
                    current.push(c);
                    in_word = true;
                }
            }
        }

        if let Some(q) = quote {
            bail!("Unterminated {} quote in command template", q);
        }
        if in_word {
            parts.push(current);
        }
        if parts.is_empty() {
            bail!("Empty command template");
        }
        Ok(Self { parts })
    }

    /// Program name (first word)
    pub fn program(&self) -> &str {
        &self.parts[0]
    }

    /// Substitute placeholders and return the argv
    pub fn render(&self, vars: &[(&str, String)]) -> Vec<String> {
        self.parts
            .iter()
            .map(|part| {
                let mut rendered = part.clone();
                for (name, value) in vars {
                    rendered = rendered.replace(&format!("{{{}}}", name), value);
                }
                rendered
            })
            .collect()
    }
}

/// Run a program to completion, failing on non-zero exit
///
/// Returns captured stdout.
pub async fn run(program: &str, args: &[String], limit: Duration) -> Result<String> {
    debug!(program, ?args, "Running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout(limit, cmd.output()).await {
        Ok(result) => result.with_context(|| format!("Failed to run {}", program))?,
        Err(_) => bail!("{} timed out after {} seconds", program, limit.as_secs_f64()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        bail!("{} exited with code {}: {}", program, exit_code, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a rendered template
pub async fn run_template(
    template: &CommandTemplate,
    vars: &[(&str, String)],
    limit: Duration,
) -> Result<String> {
    let argv = template.render(vars);
    run(&argv[0], &argv[1..], limit).await
}

/// Check whether a program is on PATH
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_render() {
        let template = CommandTemplate::parse("sips -z {height} {width}  {path}").unwrap();
        assert_eq!(template.program(), "sips");

        let argv = template.render(&[
            ("width", "1200".to_string()),
            ("height", "800".to_string()),
            ("path", "/tmp/shot file.png".to_string()),
        ]);
        assert_eq!(argv, vec!["sips", "-z", "800", "1200", "/tmp/shot file.png"]);
    }

    #[test]
    fn test_template_embedded_placeholders() {
        let template =
            CommandTemplate::parse("convert {path} -resize {width}x{height}! {path}").unwrap();
        let argv = template.render(&[
            ("width", "10".to_string()),
            ("height", "20".to_string()),
            ("path", "a.png".to_string()),
        ]);
        assert_eq!(argv[3], "10x20!");
    }

    #[test]
    fn test_empty_template() {
        assert!(CommandTemplate::parse("   ").is_err());
    }

    #[test]
    fn test_template_quoting() {
        let template =
            CommandTemplate::parse(r#"osascript -l JavaScript -e 'var s = "a b"; s'"#).unwrap();
        assert_eq!(
            template.render(&[]),
            vec!["osascript", "-l", "JavaScript", "-e", r#"var s = "a b"; s"#]
        );

        let template = CommandTemplate::parse(r#"echo "" x"#).unwrap();
        assert_eq!(template.render(&[]), vec!["echo", "", "x"]);

        assert!(CommandTemplate::parse("echo 'open").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success_and_failure() {
        let out = run("echo", &["hello".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");

        let args = ["-c".to_string(), "echo bad >&2; exit 3".to_string()];
        let err = run("sh", &args, Duration::from_secs(5))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"));
        assert!(msg.contains("bad"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout() {
        let err = run("sleep", &["5".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
