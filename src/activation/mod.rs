//! Activation worker
//!
//! Runs once after the network comes up: applies a pending asset download,
//! checks for new firmware with bounded retries, walks the user through the
//! activation handshake and finally raises `ActivationDone`. It never
//! touches the display directly; every UI change is scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::device::{strings, ActivationInfo, ChatRole, FirmwareInfo, OtaError, PowerSaveLevel, Services, Sound};
use crate::events::EventFlag;
use crate::orchestrator::{show_alert, Scheduler};
use crate::state::{DeviceState, DeviceStateMachine};
use crate::store;

/// Retry limits and pacing
#[derive(Debug, Clone)]
pub struct ActivationPolicy {
    pub max_check_attempts: u32,
    /// First retry delay; doubles after every failed check
    pub initial_retry_delay: Duration,
    /// Granularity at which retry sleeps notice the device going idle
    pub poll_interval: Duration,
    pub max_activation_attempts: u32,
    /// Pause after the server answered "not yet"
    pub activation_timeout_delay: Duration,
    /// Pause after any other activation error
    pub activation_error_delay: Duration,
    /// How long alerts stay up before the next step
    pub alert_pause: Duration,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self {
            max_check_attempts: 10,
            initial_retry_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            max_activation_attempts: 10,
            activation_timeout_delay: Duration::from_secs(3),
            activation_error_delay: Duration::from_secs(10),
            alert_pause: Duration::from_secs(3),
        }
    }
}

/// How the worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResult {
    /// `ActivationDone` was raised
    Completed { has_server_time: bool },
    /// New firmware was installed; the device must restart
    RebootRequired,
    /// The device left the activation flow (e.g. back to Wi-Fi setup)
    Aborted,
}

pub struct ActivationRetryLoop {
    services: Services,
    scheduler: Scheduler,
    state: Arc<DeviceStateMachine>,
    policy: ActivationPolicy,
    assets_checked: AtomicBool,
}

impl ActivationRetryLoop {
    pub fn new(
        services: Services,
        scheduler: Scheduler,
        state: Arc<DeviceStateMachine>,
        policy: ActivationPolicy,
    ) -> Self {
        Self {
            services,
            scheduler,
            state,
            policy,
            assets_checked: AtomicBool::new(false),
        }
    }

    /// Run the whole activation sequence on the calling (worker) thread
    pub fn run(&self) -> ActivationResult {
        self.check_assets();

        let result = self.check_new_version();
        if let ActivationResult::Completed { has_server_time } = result {
            info!(has_server_time, "activation complete");
            self.scheduler.raise(EventFlag::ActivationDone);
        }
        result
    }

    fn in_activation_flow(&self) -> bool {
        matches!(
            self.state.state(),
            DeviceState::Activating | DeviceState::Idle | DeviceState::Upgrading
        )
    }

    /// Download assets announced by the previous run, at most once per process
    fn check_assets(&self) {
        if self.assets_checked.swap(true, Ordering::SeqCst) {
            return;
        }

        let url = match store::take_pending_download_url(self.services.settings.as_ref()) {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read pending asset download");
                return;
            }
        };

        info!(url, "downloading new assets");
        let message = format!("Found new assets: {url}");
        self.alert(strings::LOADING_ASSETS, &message, "cloud_arrow_down", Some(Sound::Upgrade));
        thread::sleep(self.policy.alert_pause);

        self.state.transition_to(DeviceState::Upgrading);
        self.services.board.set_power_save_level(PowerSaveLevel::Performance);
        self.chat(strings::PLEASE_WAIT.to_string());

        let result = self
            .services
            .ota
            .download_assets(&url, &mut |percent, speed| self.report_progress(percent, speed));
        self.services.board.set_power_save_level(PowerSaveLevel::LowPower);

        if let Err(e) = result {
            error!(url, error = %e, "asset download failed");
            self.alert(
                strings::ERROR,
                strings::DOWNLOAD_ASSETS_FAILED,
                "circle_xmark",
                Some(Sound::Exclamation),
            );
            thread::sleep(self.policy.alert_pause);
            self.state.transition_to(DeviceState::Activating);
            return;
        }

        let display = Arc::clone(&self.services.display);
        self.scheduler.schedule(move || {
            display.set_chat_message(ChatRole::System, "");
            display.set_emotion("microchip_ai");
        });
    }

    fn check_new_version(&self) -> ActivationResult {
        let ota = &self.services.ota;
        let mut failures = 0u32;
        let mut retry_delay = self.policy.initial_retry_delay;

        loop {
            if !self.in_activation_flow() {
                warn!(state = %self.state.state(), "left activation flow, stopping version check");
                return ActivationResult::Aborted;
            }
            self.status(strings::CHECKING_NEW_VERSION);

            let info = match ota.check_version() {
                Ok(info) => info,
                Err(e) => {
                    failures += 1;
                    if failures >= self.policy.max_check_attempts {
                        error!(attempts = failures, error = %e, "version check gave up");
                        return ActivationResult::Completed { has_server_time: false };
                    }
                    warn!(
                        attempt = failures,
                        max = self.policy.max_check_attempts,
                        retry_in_s = retry_delay.as_secs(),
                        error = %e,
                        "version check failed"
                    );
                    let message = format!(
                        "Check for new version failed, retry in {} seconds: {e} ({})",
                        retry_delay.as_secs(),
                        ota.check_version_url()
                    );
                    self.alert(strings::ERROR, &message, "cloud_slash", Some(Sound::Exclamation));
                    self.sleep_unless_idle(retry_delay);
                    retry_delay *= 2;
                    continue;
                }
            };
            failures = 0;
            retry_delay = self.policy.initial_retry_delay;

            if let Some(firmware) = &info.firmware {
                if self.upgrade_firmware(firmware) {
                    return ActivationResult::RebootRequired;
                }
            }

            ota.mark_current_version_valid();
            let needs_activation = info.needs_activation();
            let activation = match info.activation {
                Some(activation) if needs_activation => activation,
                _ => {
                    return ActivationResult::Completed {
                        has_server_time: info.has_server_time,
                    }
                }
            };

            self.status(strings::ACTIVATION);
            if let Some(code) = &activation.code {
                self.show_activation_code(code, &activation.message);
            }
            if let Some(result) = self.poll_activation(&activation) {
                return result;
            }
        }
    }

    /// Poll `activate` until accepted, out of attempts, or interrupted
    ///
    /// Returns `Some` only when the loop must end.
    fn poll_activation(&self, activation: &ActivationInfo) -> Option<ActivationResult> {
        let attempts = self.policy.max_activation_attempts;
        for attempt in 1..=attempts {
            info!(attempt, attempts, "activating");
            match self.services.ota.activate(activation) {
                Ok(()) => return None,
                Err(OtaError::Timeout) => thread::sleep(self.policy.activation_timeout_delay),
                Err(e) => {
                    warn!(attempt, error = %e, "activation failed");
                    thread::sleep(self.policy.activation_error_delay);
                }
            }
            match self.state.state() {
                DeviceState::Idle => return None,
                _ if !self.in_activation_flow() => return Some(ActivationResult::Aborted),
                _ => {}
            }
        }
        None
    }

    /// Returns `true` when the new firmware is installed
    fn upgrade_firmware(&self, firmware: &FirmwareInfo) -> bool {
        let version = if firmware.version.is_empty() {
            "(Manual upgrade)".to_string()
        } else {
            firmware.version.clone()
        };
        info!(url = %firmware.url, version, "starting firmware upgrade");

        let protocol = Arc::clone(&self.services.protocol);
        self.scheduler.invoke(move || {
            if protocol.is_audio_channel_opened() {
                protocol.close_audio_channel();
            }
        });

        self.alert(strings::OTA_UPGRADE, strings::UPGRADING, "download", Some(Sound::Upgrade));
        thread::sleep(self.policy.alert_pause);

        self.state.transition_to(DeviceState::Upgrading);
        self.chat(format!("{}{version}", strings::NEW_VERSION));
        self.services.board.set_power_save_level(PowerSaveLevel::Performance);
        let audio = Arc::clone(&self.services.audio);
        self.scheduler.invoke(move || audio.stop());

        let result = self
            .services
            .ota
            .upgrade(&firmware.url, &mut |percent, speed| self.report_progress(percent, speed));

        match result {
            Ok(()) => {
                info!(version, "firmware upgrade installed");
                self.chat("Upgrade successful, rebooting...".to_string());
                true
            }
            Err(e) => {
                error!(error = %e, "firmware upgrade failed, continuing on current firmware");
                let audio = Arc::clone(&self.services.audio);
                self.scheduler.invoke(move || audio.start());
                self.services.board.set_power_save_level(PowerSaveLevel::LowPower);
                self.alert(strings::ERROR, strings::UPGRADE_FAILED, "circle_xmark", Some(Sound::Exclamation));
                thread::sleep(self.policy.alert_pause);
                false
            }
        }
    }

    fn show_activation_code(&self, code: &str, message: &str) {
        info!(code, "showing activation code");
        let services = self.services.clone();
        let (code, message) = (code.to_string(), message.to_string());
        self.scheduler.schedule(move || {
            show_alert(&services, strings::ACTIVATION, &message, "link", Some(Sound::Activation));
            for digit in code.chars().filter_map(|c| c.to_digit(10)) {
                services.audio.play_sound(Sound::Digit(digit as u8));
            }
        });
    }

    /// Sleep for `delay`, waking early once the device is idle
    fn sleep_unless_idle(&self, delay: Duration) {
        let mut remaining = delay;
        while !remaining.is_zero() {
            let step = remaining.min(self.policy.poll_interval);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
            if self.state.state() == DeviceState::Idle {
                break;
            }
        }
    }

    fn report_progress(&self, percent: u8, bytes_per_second: usize) {
        self.chat(format!("{percent}% {}KB/s", bytes_per_second / 1024));
    }

    fn status(&self, status: &'static str) {
        let display = Arc::clone(&self.services.display);
        self.scheduler.schedule(move || display.set_status(status));
    }

    fn chat(&self, message: String) {
        let display = Arc::clone(&self.services.display);
        self.scheduler
            .schedule(move || display.set_chat_message(ChatRole::System, &message));
    }

    fn alert(&self, status: &'static str, message: &str, emotion: &'static str, sound: Option<Sound>) {
        let services = self.services.clone();
        let message = message.to_string();
        self.scheduler
            .schedule(move || show_alert(&services, status, &message, emotion, sound));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VersionInfo;
    use crate::testing::Fakes;

    fn fast_policy() -> ActivationPolicy {
        ActivationPolicy {
            max_check_attempts: 3,
            initial_retry_delay: Duration::from_millis(4),
            poll_interval: Duration::from_millis(1),
            max_activation_attempts: 3,
            activation_timeout_delay: Duration::from_millis(1),
            activation_error_delay: Duration::from_millis(1),
            alert_pause: Duration::ZERO,
        }
    }

    fn retry_loop(fakes: &Fakes) -> ActivationRetryLoop {
        fakes.state.transition_to(DeviceState::Activating);
        ActivationRetryLoop::new(
            fakes.services(),
            fakes.scheduler.clone(),
            Arc::clone(&fakes.state),
            fast_policy(),
        )
    }

    fn activation_done(fakes: &Fakes) -> bool {
        fakes.events.pending().contains(EventFlag::ActivationDone)
    }

    #[test]
    fn test_up_to_date_completes_once() {
        let fakes = Fakes::new();
        fakes.ota.push_check(Ok(VersionInfo {
            has_server_time: true,
            ..VersionInfo::default()
        }));

        let result = retry_loop(&fakes).run();
        assert_eq!(result, ActivationResult::Completed { has_server_time: true });
        assert!(activation_done(&fakes));
        assert!(fakes.ota.log.contains("mark_valid"));
    }

    #[test]
    fn test_check_failures_retry_then_succeed() {
        let fakes = Fakes::new();
        fakes.ota.push_check(Err(OtaError::Status(503)));
        fakes.ota.push_check(Err(OtaError::Status(503)));

        let result = retry_loop(&fakes).run();
        assert_eq!(result, ActivationResult::Completed { has_server_time: false });
        assert_eq!(fakes.ota.check_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_check_gives_up_after_max_attempts() {
        let fakes = Fakes::new();
        for _ in 0..5 {
            fakes.ota.push_check(Err(OtaError::Status(500)));
        }

        let result = retry_loop(&fakes).run();
        assert!(matches!(result, ActivationResult::Completed { .. }));
        assert_eq!(fakes.ota.check_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_leaving_flow_aborts_without_done() {
        let fakes = Fakes::new();
        let retry = retry_loop(&fakes);
        fakes.state.transition_to(DeviceState::WifiConfiguring);

        assert_eq!(retry.run(), ActivationResult::Aborted);
        assert!(!fakes.events.pending().contains(EventFlag::ActivationDone));
        assert_eq!(fakes.ota.check_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_activation_code_announced_and_polled() {
        let fakes = Fakes::new();
        fakes.ota.push_check(Ok(VersionInfo {
            activation: Some(ActivationInfo {
                code: Some("407".into()),
                message: "Enter code".into(),
                challenge: Some("abc".into()),
            }),
            ..VersionInfo::default()
        }));
        fakes.ota.push_activation(Err(OtaError::Timeout));
        fakes.ota.push_activation(Ok(()));

        let result = retry_loop(&fakes).run();
        assert!(matches!(result, ActivationResult::Completed { .. }));
        assert_eq!(fakes.ota.activate_calls.load(Ordering::SeqCst), 2);

        fakes.scheduler.run_pending();
        let sounds: Vec<_> = fakes
            .audio
            .log
            .all()
            .into_iter()
            .filter(|c| c.starts_with("sound:"))
            .collect();
        assert_eq!(
            sounds,
            vec!["sound:Activation", "sound:Digit(4)", "sound:Digit(0)", "sound:Digit(7)"]
        );
    }

    #[test]
    fn test_failed_upgrade_recovers_locally() {
        let fakes = Fakes::new();
        fakes.ota.upgrade_fails.store(true, Ordering::SeqCst);
        fakes.ota.push_check(Ok(VersionInfo {
            firmware: Some(FirmwareInfo {
                version: "2.0.0".into(),
                url: "http://ota.test/fw.bin".into(),
            }),
            ..VersionInfo::default()
        }));

        // invoke() runs inline on the bound thread
        fakes.scheduler.bind_current_thread();
        let result = retry_loop(&fakes).run();

        assert!(matches!(result, ActivationResult::Completed { .. }));
        assert!(fakes.ota.log.contains("upgrade:http://ota.test/fw.bin"));
        assert_eq!(fakes.audio.log.all(), vec!["stop", "start"]);
        assert_eq!(
            fakes.board.power_levels(),
            vec![PowerSaveLevel::Performance, PowerSaveLevel::LowPower]
        );
    }

    #[test]
    fn test_successful_upgrade_requires_reboot() {
        let fakes = Fakes::new();
        fakes.ota.push_check(Ok(VersionInfo {
            firmware: Some(FirmwareInfo {
                version: "2.0.0".into(),
                url: "http://ota.test/fw.bin".into(),
            }),
            ..VersionInfo::default()
        }));
        fakes.scheduler.bind_current_thread();

        assert_eq!(retry_loop(&fakes).run(), ActivationResult::RebootRequired);
        assert!(!fakes.events.pending().contains(EventFlag::ActivationDone));
    }

    #[test]
    fn test_pending_assets_downloaded_once() {
        let fakes = Fakes::new();
        store::set_pending_download_url(fakes.settings.as_ref(), "http://x/assets.bin").unwrap();

        let retry = retry_loop(&fakes);
        retry.run();
        retry.run();

        let downloads: Vec<_> = fakes
            .ota
            .log
            .all()
            .into_iter()
            .filter(|c| c.starts_with("assets:"))
            .collect();
        assert_eq!(downloads, vec!["assets:http://x/assets.bin"]);
        assert!(store::take_pending_download_url(fakes.settings.as_ref()).unwrap().is_none());
    }
}
