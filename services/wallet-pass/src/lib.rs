//! 钱包卡解析与发放服务
//!
//! 无状态发卡引擎：平台分流、等级裁决、Google save 链接签发、
//! 二进制卡包生成与设备回调。除遥测外不落任何库。

pub mod archive;
pub mod callbacks;
pub mod error;
pub mod events;
pub mod google;
pub mod member;
pub mod platform;
pub mod routes;
pub mod state;
pub mod tier;
pub mod token;
