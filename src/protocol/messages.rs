//! Message names and option keys spoken by the media server.
//!
//! Names are defined by the server and are not ours to change. They are
//! modelled as enums so that call sites cannot misspell them, with
//! [`Display`](fmt::Display) and [`FromStr`] mapping to and from the wire.

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Requests the client can send.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Request {
    /// First message on every new socket, carrying the password.
    Authenticate,
    /// Heartbeat.
    Ping,
    GetPlaybackOverview,
    PauseOrResume,
    Stop,
    Previous,
    Next,
    PlayAtIndex,
    PlayAllTracks,
    PlayTracksByCategory,
    QueryTracks,
    QueryTracksByCategory,
    QueryCategory,
    QueryPlayQueueTracks,
    SeekTo,
    SeekRelative,
    SetVolume,
    ToggleShuffle,
    ToggleRepeat,
    ToggleMute,
}

/// Notifications the server pushes without being asked.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Broadcast {
    PlaybackOverviewChanged,
    PlayQueueChanged,
}

/// Common option keys.
pub mod key {
    pub const API_VERSION: &str = "api_version";
    pub const CATEGORY: &str = "category";
    pub const CATEGORY_ID: &str = "category_id";
    pub const COUNT: &str = "count";
    pub const COUNT_ONLY: &str = "count_only";
    pub const DATA: &str = "data";
    pub const DELTA: &str = "delta";
    pub const ENVIRONMENT: &str = "environment";
    pub const ERROR: &str = "error";
    pub const FILTER: &str = "filter";
    pub const ID: &str = "id";
    pub const INDEX: &str = "index";
    pub const LIMIT: &str = "limit";
    pub const OFFSET: &str = "offset";
    pub const PASSWORD: &str = "password";
    pub const POSITION: &str = "position";
    pub const RELATIVE: &str = "relative";
    pub const VOLUME: &str = "volume";
}

impl Request {
    const ALL: [Self; 20] = [
        Self::Authenticate,
        Self::Ping,
        Self::GetPlaybackOverview,
        Self::PauseOrResume,
        Self::Stop,
        Self::Previous,
        Self::Next,
        Self::PlayAtIndex,
        Self::PlayAllTracks,
        Self::PlayTracksByCategory,
        Self::QueryTracks,
        Self::QueryTracksByCategory,
        Self::QueryCategory,
        Self::QueryPlayQueueTracks,
        Self::SeekTo,
        Self::SeekRelative,
        Self::SetVolume,
        Self::ToggleShuffle,
        Self::ToggleRepeat,
        Self::ToggleMute,
    ];

    /// Wire name of the request.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Ping => "ping",
            Self::GetPlaybackOverview => "get_playback_overview",
            Self::PauseOrResume => "pause_or_resume",
            Self::Stop => "stop",
            Self::Previous => "previous",
            Self::Next => "next",
            Self::PlayAtIndex => "play_at_index",
            Self::PlayAllTracks => "play_all_tracks",
            Self::PlayTracksByCategory => "play_tracks_by_category",
            Self::QueryTracks => "query_tracks",
            Self::QueryTracksByCategory => "query_tracks_by_category",
            Self::QueryCategory => "query_category",
            Self::QueryPlayQueueTracks => "query_play_queue_tracks",
            Self::SeekTo => "seek_to",
            Self::SeekRelative => "seek_relative",
            Self::SetVolume => "set_volume",
            Self::ToggleShuffle => "toggle_shuffle",
            Self::ToggleRepeat => "toggle_repeat",
            Self::ToggleMute => "toggle_mute",
        }
    }

    /// Whether `name` is the wire name of this request.
    #[must_use]
    pub fn is(self, name: &str) -> bool {
        self.as_str() == name
    }
}

impl Broadcast {
    const ALL: [Self; 2] = [Self::PlaybackOverviewChanged, Self::PlayQueueChanged];

    /// Wire name of the broadcast.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlaybackOverviewChanged => "playback_overview_changed",
            Self::PlayQueueChanged => "play_queue_changed",
        }
    }

    /// Whether `name` is the wire name of this broadcast.
    #[must_use]
    pub fn is(self, name: &str) -> bool {
        self.as_str() == name
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|request| request.is(s))
            .ok_or_else(|| Error::unimplemented(format!("request `{s}`")))
    }
}

impl FromStr for Broadcast {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|broadcast| broadcast.is(s))
            .ok_or_else(|| Error::unimplemented(format!("broadcast `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for request in Request::ALL {
            assert_eq!(request.to_string().parse::<Request>().unwrap(), request);
        }
        for broadcast in Broadcast::ALL {
            assert_eq!(broadcast.to_string().parse::<Broadcast>().unwrap(), broadcast);
        }
    }

    #[test]
    fn unknown_names_are_unimplemented() {
        let err = "launch_rockets".parse::<Request>().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unimplemented);
        assert!("ping".parse::<Broadcast>().is_err());
    }

    #[test]
    fn matches_by_wire_name() {
        assert!(Broadcast::PlayQueueChanged.is("play_queue_changed"));
        assert!(!Broadcast::PlayQueueChanged.is("playback_overview_changed"));
        assert!(Request::QueryPlayQueueTracks.is("query_play_queue_tracks"));
    }
}
