//! SMS認証コード（二段階認証）の入力待ち

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::AuthError;

/// ポータルがコード入力を求めたときの表示内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePrompt {
    pub message: String,
}

/// コードの供給元。ログイン処理はここで停止してコードを待つ
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// コードを返す。供給できない場合は None
    async fn provide_code(&self, prompt: &ChallengePrompt) -> Option<String>;
}

/// 端末からコードを読み取る
#[derive(Debug, Clone, Default)]
pub struct StdinChallenge;

#[async_trait]
impl ChallengeHandler for StdinChallenge {
    async fn provide_code(&self, prompt: &ChallengePrompt) -> Option<String> {
        eprintln!("{}", prompt.message);
        eprint!("SMS code: ");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(e) => {
                warn!("Failed to read SMS code from stdin: {}", e);
                None
            }
        }
    }
}

/// コードを供給しない（無人実行用）
#[derive(Debug, Clone, Default)]
pub struct NoChallenge;

#[async_trait]
impl ChallengeHandler for NoChallenge {
    async fn provide_code(&self, _prompt: &ChallengePrompt) -> Option<String> {
        None
    }
}

/// タイムアウト付きでコードを待つ
pub async fn await_code(
    handler: &dyn ChallengeHandler,
    prompt: &ChallengePrompt,
    timeout: Duration,
) -> Result<String, AuthError> {
    info!(timeout_secs = timeout.as_secs(), "Waiting for second-factor code");

    match tokio::time::timeout(timeout, handler.provide_code(prompt)).await {
        Ok(Some(code)) if !code.trim().is_empty() => Ok(code.trim().to_string()),
        Ok(_) => {
            warn!("Second-factor code was not supplied");
            Err(AuthError::ChallengeTimeout(timeout))
        }
        Err(_) => {
            warn!("Second-factor code wait timed out");
            Err(AuthError::ChallengeTimeout(timeout))
        }
    }
}
