use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{RoomStore, StoreError};
use crate::model::{Answer, Offer, Participant, Room, RoomId};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Store client over a plain REST mapping of the room-store operations.
/// One resource per room, append-only collections for offers and answers.
pub struct HttpRoomStore {
    client: Client,
    base: Url,
}

impl HttpRoomStore {
    /// Accepts `host:port` or a full `http(s)://` URL; anything else is an
    /// `InvalidUrl` error.
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let base = normalize_base_url(base_url)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl("store url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, StoreError> {
        let response = self.client.get(url).send().await?;
        decode_json(response).await
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<Response, StoreError> {
        let response = self.client.post(url).json(body).send().await?;
        ensure_success(response).await
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, StoreError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidUrl("store url must not be empty".into()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate)
        .map_err(|err| StoreError::InvalidUrl(format!("{trimmed}: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(StoreError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(StoreError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(url)
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|err| StoreError::Decode(err.to_string()))
}

#[derive(Serialize)]
struct CreateRoomRequest<'a> {
    name: &'a str,
    creator: &'a Participant,
}

#[derive(Deserialize)]
struct CreateRoomResponse {
    id: RoomId,
}

#[async_trait]
impl RoomStore for HttpRoomStore {
    async fn create_room(&self, name: &str, creator: &Participant) -> Result<RoomId, StoreError> {
        let url = self.endpoint(&["rooms"])?;
        let response = self
            .post_json(url, &CreateRoomRequest { name, creator })
            .await?;
        let created: CreateRoomResponse = response
            .json()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        debug!(target: "store", room = %created.id, name, "room created");
        Ok(created.id)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let url = self.endpoint(&["rooms"])?;
        self.get_json(url).await
    }

    async fn list_participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError> {
        let url = self.endpoint(&["rooms", room.as_str(), "participants"])?;
        self.get_json(url).await
    }

    async fn publish_offer(&self, room: &RoomId, offer: &Offer) -> Result<(), StoreError> {
        let url = self.endpoint(&["rooms", room.as_str(), "offers"])?;
        self.post_json(url, offer).await?;
        debug!(
            target: "store",
            room = %room,
            recipient = %offer.recipient,
            "offer published"
        );
        Ok(())
    }

    async fn list_offers(&self, room: &RoomId) -> Result<Vec<Offer>, StoreError> {
        let url = self.endpoint(&["rooms", room.as_str(), "offers"])?;
        self.get_json(url).await
    }

    async fn publish_answer(&self, room: &RoomId, answer: &Answer) -> Result<(), StoreError> {
        let url = self.endpoint(&["rooms", room.as_str(), "answers"])?;
        self.post_json(url, answer).await?;
        debug!(
            target: "store",
            room = %room,
            initiator = %answer.offer.initiator,
            "answer published"
        );
        Ok(())
    }

    async fn list_answers(&self, room: &RoomId) -> Result<Vec<Answer>, StoreError> {
        let url = self.endpoint(&["rooms", room.as_str(), "answers"])?;
        self.get_json(url).await
    }
}
