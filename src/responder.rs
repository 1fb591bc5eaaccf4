//! 本機 HTTP-01 挑戰回應程式的啟動、探測與停止。
//!
//! 回應程式是獨立的子程序，以 `{program} httpchallenge keys={control},{check}` 啟動。
//! 對 check key 的請求回應 `OK` 表示正在運行；對 control key 的請求要求它自行結束。

use std::{path::PathBuf, process::Stdio, time::Duration};

use reqwest::Client;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreSettings;

/// 存活檢查使用的固定 key。
pub const CHECK_KEY: &str = "configcheck";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct ChallengeResponder {
    client: Client,
    port: u16,
    program: PathBuf,
    control_key: String,
    startup_delay: Duration,
    /// 同時只允許一個診斷流程啟動或停止回應程式。
    state: Mutex<ResponderState>,
}

/// 子程序與目前仍在使用回應程式的診斷流程數。
#[derive(Debug, Default)]
struct ResponderState {
    child: Option<Child>,
    users: usize,
}

impl ChallengeResponder {
    pub fn new(settings: &CoreSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(format!("{} responder-probe", settings.user_agent))
            .timeout(PROBE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            port: settings.http_challenge_port,
            program: settings.http_challenge_program.clone(),
            control_key: Uuid::new_v4().to_string(),
            startup_delay: Duration::from_secs(1),
            state: Mutex::new(ResponderState::default()),
        })
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn control_key(&self) -> &str {
        &self.control_key
    }

    fn url(&self, key: &str) -> String {
        format!(
            "http://127.0.0.1:{}/.well-known/acme-challenge/{}",
            self.port, key
        )
    }

    /// 對 check key 發出請求，回應 `OK` 才算運行中；任何錯誤都視為未運行。
    pub async fn is_running(&self) -> bool {
        let response = match self.client.get(self.url(CHECK_KEY)).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "challenge responder probe rejected");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "challenge responder probe failed");
                return false;
            }
        };
        matches!(response.text().await.as_deref(), Ok("OK"))
    }

    /// 已在運行時直接回傳 `true`；否則啟動子程序，等待後再探測一次。
    ///
    /// 每次呼叫都登記一個使用者，無論結果如何都必須以 [`stop`](Self::stop) 配對。
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        state.users += 1;
        if self.is_running().await {
            return true;
        }

        let spawned = Command::new(&self.program)
            .arg("httpchallenge")
            .arg(format!("keys={},{}", self.control_key, CHECK_KEY))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(process) => {
                info!(program = %self.program.display(), port = self.port, "challenge responder launched");
                state.child = Some(process);
            }
            Err(e) => {
                warn!(program = %self.program.display(), error = %e, "failed to launch challenge responder");
                return false;
            }
        }

        tokio::time::sleep(self.startup_delay).await;
        self.is_running().await
    }

    /// 釋放一個使用者；最後一個使用者先以 control key 要求結束，不成功時終止子程序。
    /// 永不回傳錯誤。
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.users == 0 {
            debug!("challenge responder stop without matching start");
            return;
        }
        state.users -= 1;
        if state.users > 0 {
            debug!(users = state.users, "challenge responder still in use");
            return;
        }

        let graceful = match self.client.get(self.url(&self.control_key)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "challenge responder stop request failed");
                false
            }
        };

        let Some(mut process) = state.child.take() else {
            return;
        };
        if graceful
            && tokio::time::timeout(EXIT_GRACE, process.wait())
                .await
                .is_ok()
        {
            debug!("challenge responder exited");
            return;
        }
        if let Err(e) = process.kill().await {
            warn!(error = %e, "failed to kill challenge responder");
        }
    }
}
