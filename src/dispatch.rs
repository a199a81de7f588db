use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::LauncherConfig;
use crate::error::{LaunchError, Result};
use crate::flags::effective_flags;
use crate::handle::{HandleKind, NativeHandle, RawHandle};
use crate::native::{CreateCall, NativeApi, NativeResult, ProcessInformation};
use crate::record::ProcessRecord;
use crate::request::{environment_block, CreationMode, CreationRequest, Credential};

/// Picks and invokes the native creation primitive for a request.
///
/// * [`CreationMode::Direct`] → `CreateProcessW`
/// * [`CreationMode::LogonWithCredentials`] → `CreateProcessWithLogonW`
/// * [`CreationMode::ExistingToken`] → `CreateProcessWithTokenW`
/// * [`CreationMode::LogonThenImpersonate`] → `LogonUserW` + `CreateProcessAsUserW`
///
/// Which of these a caller may use depends on its own privileges: a service
/// running as SYSTEM is refused `CreateProcessWithLogonW` and has to mint a
/// token instead.
#[derive(Debug, Clone)]
pub struct ProcessCreationDispatcher {
    api: Arc<dyn NativeApi>,
    config: LauncherConfig,
}

impl ProcessCreationDispatcher {
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self::with_config(api, LauncherConfig::default())
    }

    pub fn with_config(api: Arc<dyn NativeApi>, config: LauncherConfig) -> Self {
        Self { api, config }
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.api
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Creates the process described by `request`.
    ///
    /// Either a complete [`ProcessRecord`] is returned or nothing was created;
    /// any token minted along the way is released before returning.
    pub fn create(&self, request: &CreationRequest) -> Result<ProcessRecord> {
        request.mode.validate()?;
        let mode = request.mode.kind();

        let effective = effective_flags(request.creation_flags, mode);
        if effective.stripped {
            warn!(
                requested = ?request.creation_flags,
                %mode,
                "DETACHED_PROCESS is incompatible with CREATE_NEW_CONSOLE, which is implied \
                 for the logon and token creation modes; creating with default flags"
            );
        }

        let environment = request
            .environment
            .as_ref()
            .map(environment_block)
            .transpose()?;
        let command_line = request.resolved_command_line();
        let startup = request.resolved_startup();

        let call = CreateCall {
            application_name: request.application_name.as_deref(),
            command_line: &command_line,
            process_attributes: request.process_attributes.as_ref(),
            thread_attributes: request.thread_attributes.as_ref(),
            inherit_handles: request.inherit_handles,
            creation_flags: effective.flags.bits(),
            environment: environment.as_deref(),
            current_directory: request.current_directory.as_deref(),
            startup: &startup,
        };
        debug!(%mode, flags = ?effective.flags, inherit_handles = call.inherit_handles, "creating process");

        let created = match &request.mode {
            CreationMode::Direct => self.api.create_process(&call),
            CreationMode::LogonWithCredentials {
                credential,
                logon_flags,
            } => self
                .api
                .create_process_with_logon(credential, *logon_flags, &call),
            CreationMode::ExistingToken { token, logon_flags } => self
                .api
                .create_process_with_token(*token, *logon_flags, &call),
            CreationMode::LogonThenImpersonate { credential } => {
                let token = self.logon(credential)?;
                self.create_as_user(token.as_raw()?, &call)
                // `token` is released here whether creation succeeded or not.
            }
        };

        let info = created.map_err(|code| {
            debug!(%mode, code, "process creation failed");
            LaunchError::CreateProcessFailure { code }
        })?;

        debug!(%mode, pid = info.process_id, tid = info.thread_id, "process created");
        Ok(ProcessRecord::from_information(self.api.clone(), info))
    }

    /// Mints a primary token for `credential` with the configured logon type
    /// and provider.
    pub fn logon(&self, credential: &Credential) -> Result<NativeHandle> {
        let mut raw: RawHandle = 0;
        let result = self.api.logon_user(
            credential,
            self.config.logon_type,
            self.config.logon_provider,
            &mut raw,
        );
        let mut token = NativeHandle::owned(self.api.clone(), raw, HandleKind::Token);

        match result {
            Ok(()) => Ok(token),
            Err(code) => {
                debug!(username = credential.username(), domain = credential.domain(), code, "logon failed");
                if let Err(error) = token.close() {
                    warn!(%error, "failed to release partially acquired token");
                }
                Err(LaunchError::LogonFailure { code })
            }
        }
    }

    /// `CreateProcessAsUserW` requires inherited handles and no creation flags.
    fn create_as_user(
        &self,
        token: RawHandle,
        call: &CreateCall<'_>,
    ) -> NativeResult<ProcessInformation> {
        let call = CreateCall {
            inherit_handles: true,
            creation_flags: 0,
            ..*call
        };
        self.api.create_process_as_user(token, &call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CreationFlags;
    use crate::native::{ERROR_ACCESS_DENIED, ERROR_LOGON_FAILURE, LOGON32_LOGON_INTERACTIVE};
    use crate::testing::{FakeApi, Primitive};

    fn dispatcher(fake: &Arc<FakeApi>) -> ProcessCreationDispatcher {
        ProcessCreationDispatcher::new(fake.clone())
    }

    fn credential() -> Credential {
        Credential::new("svc_deploy", "s3cret", Some("CORP"))
    }

    #[test]
    fn direct_mode_uses_create_process_with_unicode_environment() {
        let fake = FakeApi::new();
        let request = CreationRequest::new("cmd.exe /c echo hi")
            .application_name("C:\\Windows\\System32\\cmd.exe")
            .suspended();

        let record = dispatcher(&fake).create(&request).unwrap();

        let call = fake.last_creation();
        assert_eq!(call.primitive, Primitive::CreateProcess);
        assert_eq!(call.command_line, "cmd.exe /c echo hi");
        assert_eq!(call.application_name.as_deref(), Some("C:\\Windows\\System32\\cmd.exe"));
        assert_eq!(
            call.creation_flags,
            (CreationFlags::SUSPENDED | CreationFlags::UNICODE_ENVIRONMENT).bits()
        );
        assert_ne!(record.process_id(), 0);
        assert_ne!(record.thread_id(), 0);
    }

    #[test]
    fn logon_mode_with_detached_strips_all_flags() {
        let fake = FakeApi::new();
        let request = CreationRequest::new("whoami")
            .flags(CreationFlags::SUSPENDED | CreationFlags::DETACHED)
            .mode(CreationMode::logon(credential()));

        dispatcher(&fake).create(&request).unwrap();

        let call = fake.last_creation();
        assert_eq!(call.primitive, Primitive::WithLogon);
        assert_eq!(call.creation_flags, 0);
        assert_eq!(call.username.as_deref(), Some("svc_deploy"));
        assert_eq!(call.domain.as_deref(), Some("CORP"));
    }

    #[test]
    fn existing_token_is_borrowed_not_closed() {
        let fake = FakeApi::new();
        let token = NativeHandle::owned(fake.clone(), fake.allocate_handle(), HandleKind::Token);
        let request = CreationRequest::new("whoami")
            .mode(CreationMode::existing_token(&token, 0).unwrap())
            .flags(CreationFlags::DETACHED);

        let record = dispatcher(&fake).create(&request).unwrap();

        let call = fake.last_creation();
        assert_eq!(call.primitive, Primitive::WithToken);
        assert_eq!(call.token, Some(token.as_raw().unwrap()));
        assert_eq!(call.creation_flags, 0);
        assert!(token.is_open());
        drop(record);
        assert_eq!(fake.close_count(token.as_raw().unwrap()), 0);
    }

    #[test]
    fn logon_then_impersonate_mints_and_releases_token() {
        let fake = FakeApi::new();
        let request = CreationRequest::new("whoami")
            .flags(CreationFlags::SUSPENDED)
            .mode(CreationMode::LogonThenImpersonate {
                credential: credential(),
            });

        let record = dispatcher(&fake).create(&request).unwrap();

        let logons = fake.logons();
        assert_eq!(logons.len(), 1);
        assert_eq!(logons[0].logon_type, LOGON32_LOGON_INTERACTIVE);

        let call = fake.last_creation();
        assert_eq!(call.primitive, Primitive::AsUser);
        assert!(call.inherit_handles);
        assert_eq!(call.creation_flags, 0);
        let token = call.token.unwrap();
        assert_eq!(fake.close_count(token), 1);

        drop(record);
        assert_eq!(fake.open_handle_count(), 0);
    }

    #[test]
    fn token_is_released_when_as_user_creation_fails() {
        let fake = FakeApi::new();
        fake.fail_creation(ERROR_ACCESS_DENIED);
        let request = CreationRequest::new("whoami").mode(CreationMode::LogonThenImpersonate {
            credential: credential(),
        });

        let err = dispatcher(&fake).create(&request).unwrap_err();

        assert!(matches!(err, LaunchError::CreateProcessFailure { code: ERROR_ACCESS_DENIED }));
        assert_eq!(fake.open_handle_count(), 0);
    }

    #[test]
    fn logon_failure_closes_partial_token_and_skips_creation() {
        let fake = FakeApi::new();
        fake.fail_logon(ERROR_LOGON_FAILURE, true);
        let request = CreationRequest::new("whoami").mode(CreationMode::LogonThenImpersonate {
            credential: credential(),
        });

        let err = dispatcher(&fake).create(&request).unwrap_err();

        assert!(matches!(err, LaunchError::LogonFailure { code: ERROR_LOGON_FAILURE }));
        assert!(fake.creations().is_empty());
        assert_eq!(fake.closed_handles().len(), 1);
        assert_eq!(fake.open_handle_count(), 0);
    }

    #[test]
    fn logon_failure_without_token_closes_nothing() {
        let fake = FakeApi::new();
        fake.fail_logon(ERROR_LOGON_FAILURE, false);

        let err = dispatcher(&fake).logon(&credential()).unwrap_err();

        assert_eq!(err.native_code(), Some(ERROR_LOGON_FAILURE));
        assert!(fake.closed_handles().is_empty());
        assert!(fake.double_closes().is_empty());
    }

    #[test]
    fn bad_credentials_leak_nothing() {
        let fake = FakeApi::new();
        fake.fail_creation(ERROR_LOGON_FAILURE);
        let before = fake.open_handle_count();
        let request = CreationRequest::new("whoami").mode(CreationMode::logon(credential()));

        let err = dispatcher(&fake).create(&request).unwrap_err();

        assert!(matches!(err, LaunchError::CreateProcessFailure { code: ERROR_LOGON_FAILURE }));
        assert_eq!(fake.open_handle_count(), before);
    }

    #[test]
    fn invalid_mode_is_rejected_before_any_native_call() {
        let fake = FakeApi::new();
        let request =
            CreationRequest::new("whoami").mode(CreationMode::logon(Credential::new("", "", None)));

        let err = dispatcher(&fake).create(&request).unwrap_err();

        assert!(matches!(err, LaunchError::InvalidCreationMode(_)));
        assert!(fake.creations().is_empty());
    }

    #[test]
    fn environment_is_encoded_in_key_order() {
        let fake = FakeApi::new();
        let request = CreationRequest::new("set").env("ZED", "1").env("ALPHA", "2");

        dispatcher(&fake).create(&request).unwrap();

        let env = fake.last_creation().environment.unwrap();
        assert_eq!(String::from_utf16_lossy(&env), "ALPHA=2\0ZED=1\0\0");
    }

    #[test]
    fn configured_logon_provider_is_used() {
        let fake = FakeApi::new();
        let config = LauncherConfig::default().with_logon_provider(crate::native::LOGON32_PROVIDER_WINNT50);
        let dispatcher = ProcessCreationDispatcher::with_config(fake.clone(), config);

        let token = dispatcher.logon(&credential()).unwrap();

        assert_eq!(fake.logons()[0].provider, crate::native::LOGON32_PROVIDER_WINNT50);
        drop(token);
        assert_eq!(fake.open_handle_count(), 0);
    }
}
