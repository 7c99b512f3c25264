//! Room info HTTP poller.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::Result;

const ROOM_INFO_URL: &str =
    "https://api.live.bilibili.com/xlive/web-room/v1/index/getInfoByRoom?room_id=";

/// The slice of room state the watcher acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    /// 1 means live.
    pub live_status: u8,
    /// Start time of the current live session (epoch seconds).
    pub live_start_time: i64,
    pub title: String,
    pub uname: String,
}

/// Source of room state.
#[async_trait]
pub trait RoomInfoSource: Send + Sync {
    async fn fetch(&self, room_id: u64) -> Result<RoomInfo>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    message: Option<String>,
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    room_info: ApiRoomInfo,
    anchor_info: ApiAnchorInfo,
}

#[derive(Debug, Deserialize)]
struct ApiRoomInfo {
    live_status: u8,
    live_start_time: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ApiAnchorInfo {
    base_info: ApiBaseInfo,
}

#[derive(Debug, Deserialize)]
struct ApiBaseInfo {
    uname: String,
}

/// HTTP implementation against the room info endpoint.
pub struct BilibiliRoomApi {
    client: reqwest::Client,
}

impl BilibiliRoomApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoomInfoSource for BilibiliRoomApi {
    async fn fetch(&self, room_id: u64) -> Result<RoomInfo> {
        debug!(room_id, "Fetching room info");
        let response: ApiResponse = self
            .client
            .get(format!("{}{}", ROOM_INFO_URL, room_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.code != 0 {
            return Err(crate::Error::monitor(format!(
                "room info API returned {}: {}",
                response.code,
                response.message.unwrap_or_default()
            )));
        }
        let data = response
            .data
            .ok_or_else(|| crate::Error::monitor("room info response without data"))?;

        Ok(RoomInfo {
            live_status: data.room_info.live_status,
            live_start_time: data.room_info.live_start_time,
            title: data.room_info.title,
            uname: data.anchor_info.base_info.uname,
        })
    }
}
