use std::time::Duration;

use super::models::{AttemptError, CheckStep, truncate_chars};
use super::sandbox::{ExecOptions, Language, SandboxHandle, SandboxProvider};
use crate::errors::RunnerError;

/// Longest diagnostic message kept from a check's output.
const MAX_MESSAGE_CHARS: usize = 10_000;

/// Compile-only / lint-only command per language. `find -exec ... +`
/// propagates a failing compile to the exit status.
pub fn syntax_command(language: Language) -> &'static str {
    match language {
        Language::Python => "find . -name '*.py' -exec python -m py_compile {} +",
        Language::JavaScript => "npm install && npx eslint . || true",
        Language::Java => "find . -name '*.java' -exec javac {} +",
    }
}

/// Dependency install / build command per language.
pub fn build_command(language: Language) -> &'static str {
    match language {
        Language::Python => "pip install -r requirements.txt 2>&1 || echo 'No requirements'",
        Language::JavaScript => "npm install && npm run build 2>&1 || echo 'No build'",
        Language::Java => "mvn compile 2>&1 || echo 'No Maven'",
    }
}

/// Result of one static check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: String,
    pub exit_code: i64,
}

/// Runs the syntax and build checks of one attempt inside a sandbox.
pub struct StaticValidator<'a> {
    sandbox: &'a dyn SandboxProvider,
    handle: &'a SandboxHandle,
    timeout: Duration,
}

impl<'a> StaticValidator<'a> {
    pub fn new(sandbox: &'a dyn SandboxProvider, handle: &'a SandboxHandle, timeout: Duration) -> Self {
        Self {
            sandbox,
            handle,
            timeout,
        }
    }

    async fn run(&self, command: &str) -> Result<(i64, String), RunnerError> {
        let output = self
            .sandbox
            .exec(self.handle, command, &ExecOptions::with_timeout(self.timeout))
            .await?;
        Ok((
            output.exit_code,
            truncate_chars(&output.combined(), MAX_MESSAGE_CHARS),
        ))
    }

    pub async fn check_syntax(&self) -> Result<CheckOutcome, RunnerError> {
        let (exit_code, message) = self.run(syntax_command(self.handle.language)).await?;
        Ok(CheckOutcome {
            passed: exit_code == 0,
            message,
            exit_code,
        })
    }

    /// Build problems never fail an attempt; the exit code is kept for
    /// diagnostics only.
    pub async fn check_build(&self) -> Result<CheckOutcome, RunnerError> {
        let (exit_code, message) = self.run(build_command(self.handle.language)).await?;
        if exit_code != 0 {
            tracing::debug!(exit_code, "Build command exited non-zero; treated as passed");
        }
        Ok(CheckOutcome {
            passed: true,
            message,
            exit_code,
        })
    }

    /// Syntax first, then build. Returns the attempt error of the first
    /// failing step; a check that cannot run at all is reported as a
    /// `validation` step failure.
    pub async fn validate(&self, attempt: u32) -> Result<(), AttemptError> {
        let as_validation_error = |e: RunnerError| AttemptError {
            attempt,
            step: CheckStep::Validation,
            error_type: "ValidationError".to_string(),
            message: e.to_string(),
            exit_code: None,
        };

        let syntax = self.check_syntax().await.map_err(as_validation_error)?;
        if !syntax.passed {
            return Err(AttemptError {
                attempt,
                step: CheckStep::Syntax,
                error_type: "SyntaxError".to_string(),
                message: syntax.message,
                exit_code: Some(syntax.exit_code),
            });
        }

        let build = self.check_build().await.map_err(as_validation_error)?;
        if !build.passed {
            return Err(AttemptError {
                attempt,
                step: CheckStep::Build,
                error_type: "BuildError".to_string(),
                message: build.message,
                exit_code: Some(build.exit_code),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::FakeSandbox;
    use crate::runner::workspace::WorkspaceManager;

    async fn handle_for(sandbox: &FakeSandbox, language: Language) -> (tempfile::TempDir, SandboxHandle) {
        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).create("run").await.unwrap();
        let handle = sandbox.create(language, &ws).await.unwrap();
        (root, handle)
    }

    #[tokio::test]
    async fn test_passing_checks_run_syntax_then_build() {
        let sandbox = FakeSandbox::new();
        let (_root, handle) = handle_for(&sandbox, Language::Python).await;
        let validator = StaticValidator::new(&sandbox, &handle, Duration::from_secs(5));

        assert!(validator.validate(1).await.is_ok());
        let calls = sandbox.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("py_compile"));
        assert!(calls[1].contains("pip install"));
    }

    #[tokio::test]
    async fn test_syntax_failure_skips_build() {
        let sandbox = FakeSandbox::new().on(
            "py_compile",
            1,
            "",
            "  File \"./app.py\", line 1\nSyntaxError: invalid syntax",
        );
        let (_root, handle) = handle_for(&sandbox, Language::Python).await;
        let validator = StaticValidator::new(&sandbox, &handle, Duration::from_secs(5));

        let err = validator.validate(2).await.unwrap_err();
        assert_eq!(err.attempt, 2);
        assert_eq!(err.step, CheckStep::Syntax);
        assert_eq!(err.error_type, "SyntaxError");
        assert_eq!(err.exit_code, Some(1));
        assert!(err.message.contains("invalid syntax"));
        assert_eq!(sandbox.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_is_lenient() {
        let sandbox = FakeSandbox::new().on("mvn compile", 1, "[ERROR] BUILD FAILURE", "");
        let (_root, handle) = handle_for(&sandbox, Language::Java).await;
        let validator = StaticValidator::new(&sandbox, &handle, Duration::from_secs(5));

        let build = validator.check_build().await.unwrap();
        assert!(build.passed);
        assert_eq!(build.exit_code, 1);
        assert!(validator.validate(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_sandbox_fault_is_a_validation_error() {
        let sandbox = FakeSandbox::new().on_error("eslint", "container went away");
        let (_root, handle) = handle_for(&sandbox, Language::JavaScript).await;
        let validator = StaticValidator::new(&sandbox, &handle, Duration::from_secs(5));

        let err = validator.validate(1).await.unwrap_err();
        assert_eq!(err.step, CheckStep::Validation);
        assert_eq!(err.error_type, "ValidationError");
        assert!(err.message.contains("container went away"));
        assert_eq!(err.exit_code, None);
    }

    #[tokio::test]
    async fn test_long_output_is_capped() {
        let noisy = "e".repeat(MAX_MESSAGE_CHARS * 2);
        let sandbox = FakeSandbox::new().on("py_compile", 1, &noisy, "");
        let (_root, handle) = handle_for(&sandbox, Language::Python).await;
        let validator = StaticValidator::new(&sandbox, &handle, Duration::from_secs(5));

        let syntax = validator.check_syntax().await.unwrap();
        assert_eq!(syntax.message.len(), MAX_MESSAGE_CHARS);
    }
}
