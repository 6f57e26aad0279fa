//! Bookmarks: URL entries keyed by URL, folders and separators by id.

use crate::adapters::merge::{check_remote_id, MergeAdapter, RecordKind};
use crate::sync::models::RemoteRecord;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkKind {
    Bookmark,
    Microsummary,
    Query,
    Livemark,
    Folder,
    Separator,
}

impl BookmarkKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "bookmark" => Some(Self::Bookmark),
            "microsummary" => Some(Self::Microsummary),
            "query" => Some(Self::Query),
            "livemark" => Some(Self::Livemark),
            "folder" => Some(Self::Folder),
            "separator" => Some(Self::Separator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bookmark => "bookmark",
            Self::Microsummary => "microsummary",
            Self::Query => "query",
            Self::Livemark => "livemark",
            Self::Folder => "folder",
            Self::Separator => "separator",
        }
    }

    /// Whether entries of this kind point at a URL and are keyed by it.
    pub fn has_url(&self) -> bool {
        matches!(
            self,
            Self::Bookmark | Self::Microsummary | Self::Query | Self::Livemark
        )
    }
}

/// A bookmark tree entry as the local store keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Local key: the URL for URL entries, the remote id otherwise.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BookmarkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "fxsyncId", default, skip_serializing_if = "Option::is_none")]
    pub fxsync_id: Option<String>,
}

impl Bookmark {
    /// A URL entry created locally.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            kind: BookmarkKind::Bookmark,
            url: Some(url),
            name: name.into(),
            parent_id: None,
            description: None,
            fxsync_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookmarkPayload {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    bmk_uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "parentid", default)]
    parent_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Record kind of the `bookmarks` collection.
pub struct Bookmarks;

impl RecordKind for Bookmarks {
    type Local = Bookmark;

    const COLLECTION: &'static str = "bookmarks";

    fn from_remote(record: &RemoteRecord) -> Option<(String, Bookmark)> {
        let payload: BookmarkPayload = serde_json::from_value(record.payload.clone()).ok()?;
        let kind = BookmarkKind::parse(&payload.kind)?;

        let url = payload.bmk_uri.filter(|uri| !uri.is_empty());
        let key = if kind.has_url() {
            url.clone()?
        } else {
            record.id.clone()
        };

        let bookmark = Bookmark {
            id: key.clone(),
            kind,
            url: if kind.has_url() { url } else { None },
            name: payload.title.unwrap_or_default(),
            parent_id: payload.parent_id,
            description: payload.description,
            fxsync_id: Some(record.id.clone()),
        };
        Some((key, bookmark))
    }

    fn merge(existing: Bookmark, mut incoming: Bookmark) -> Result<Bookmark> {
        check_remote_id(
            Self::COLLECTION,
            &existing.id,
            existing.fxsync_id.as_deref(),
            incoming.fxsync_id.as_deref(),
        )?;
        // The remote record is newer than anything merged before.
        incoming.id = existing.id;
        if incoming.fxsync_id.is_none() {
            incoming.fxsync_id = existing.fxsync_id;
        }
        Ok(incoming)
    }

    fn to_payload(bookmark: &Bookmark, remote_id: Option<&str>) -> Value {
        let mut payload = Map::new();
        if let Some(id) = remote_id {
            payload.insert("id".to_string(), json!(id));
        }
        payload.insert("type".to_string(), json!(bookmark.kind.as_str()));
        payload.insert("title".to_string(), json!(bookmark.name));
        if let Some(url) = &bookmark.url {
            payload.insert("bmkUri".to_string(), json!(url));
        }
        if let Some(parent) = &bookmark.parent_id {
            payload.insert("parentid".to_string(), json!(parent));
        }
        if let Some(description) = &bookmark.description {
            payload.insert("description".to_string(), json!(description));
        }
        Value::Object(payload)
    }

    fn remote_id(bookmark: &Bookmark) -> Option<&str> {
        bookmark.fxsync_id.as_deref()
    }

    fn set_remote_id(bookmark: &mut Bookmark, remote_id: Option<String>) {
        bookmark.fxsync_id = remote_id;
    }
}

/// Merges the `bookmarks` collection into a bookmarks store.
pub type BookmarksAdapter = MergeAdapter<Bookmarks>;
