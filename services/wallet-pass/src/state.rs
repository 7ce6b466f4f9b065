//! 应用状态
//!
//! 无会话、无共享可变状态：所有成员要么只读，要么自带池。

use std::sync::Arc;

use crate::archive::PassArchiveBuilder;
use crate::callbacks::CallbackAuth;
use crate::events::{EventSink, TelemetryRecorder};
use crate::google::GoogleProvisioner;
use crate::member::MemberStore;
use crate::token::CapabilityTokens;

#[derive(Clone)]
pub struct AppState {
    pub tokens: CapabilityTokens,
    pub members: Arc<dyn MemberStore>,
    pub google: Arc<GoogleProvisioner>,
    pub archives: Arc<PassArchiveBuilder>,
    pub events: Arc<dyn EventSink>,
    pub recorder: TelemetryRecorder,
    pub callback_auth: CallbackAuth,
}
