//! Participant/Track Reconciler
//!
//! Leitet aus dem rohen Teilnehmer-Snapshot der Engine stabile, UI-taugliche
//! `CallItem`s ab. Reine Funktionen: die vorherige Map wird nie verändert,
//! Zeitstempel kommen als Parameter herein.

use crate::transport::{ParticipantMap, TrackHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Anzeigename für Teilnehmer ohne gesetzten Namen
pub const DEFAULT_NAME: &str = "Guest";

/// Suffix der Screenshare-Projektion
const SCREEN_SUFFIX: &str = "-screen";

/// Abgeleitete Items, nach ID sortiert
pub type CallItems = BTreeMap<String, CallItem>;

// ============================================================================
// CALL ITEM
// ============================================================================

/// Stabile Darstellung eines Teilnehmers oder seiner Screenshare-Projektion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallItem {
    pub id: String,
    pub participant_id: String,
    pub name: String,
    pub has_name_set: bool,
    pub is_active_speaker: bool,
    pub is_loading: bool,
    pub has_loaded: bool,
    pub is_local: bool,
    pub is_mic_muted: bool,
    pub is_cam_muted: bool,
    pub is_owner: bool,
    pub is_recording: bool,
    pub is_screenshare: bool,
    pub muted_by_host: bool,
    pub last_active_date: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
    #[serde(skip)]
    pub audio_track: Option<TrackHandle>,
    #[serde(skip)]
    pub video_track: Option<TrackHandle>,
}

/// ID der Screenshare-Projektion eines Teilnehmers
pub fn screen_item_id(participant_id: &str) -> String {
    format!("{participant_id}{SCREEN_SUFFIX}")
}

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Berechnet die neue Item-Map aus Teilnehmer-Snapshot und vorheriger Map
///
/// Übernimmt `is_active_speaker`, `last_active_date`, `joined_at` und
/// `has_loaded` aus dem vorherigen Item. Teilnehmer, die im Snapshot fehlen,
/// verschwinden ersatzlos.
pub fn reconcile(
    participants: &ParticipantMap,
    previous: &CallItems,
    now: DateTime<Utc>,
) -> CallItems {
    let mut items = CallItems::new();

    for (id, participant) in participants {
        let prev = previous.get(id);
        let has_media = participant.has_audio() || participant.has_video();
        let prev_loaded = prev.is_some_and(|item| item.has_loaded);

        let (name, has_name_set) = match participant.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => (name.to_string(), true),
            _ => (DEFAULT_NAME.to_string(), false),
        };

        items.insert(
            id.clone(),
            CallItem {
                id: id.clone(),
                participant_id: id.clone(),
                name: name.clone(),
                has_name_set,
                is_active_speaker: prev.is_some_and(|item| item.is_active_speaker),
                is_loading: !prev_loaded && !has_media,
                has_loaded: prev_loaded || has_media,
                is_local: participant.is_local,
                is_mic_muted: !participant.mic_enabled,
                is_cam_muted: !participant.cam_enabled,
                is_owner: participant.is_owner,
                is_recording: participant.is_recording,
                is_screenshare: false,
                muted_by_host: participant.muted_by_host,
                last_active_date: prev.and_then(|item| item.last_active_date),
                joined_at: prev.map_or(now, |item| item.joined_at),
                audio_track: participant.audio_track.clone(),
                video_track: participant.video_track.clone(),
            },
        );

        if participant.is_sharing_screen() {
            let screen_id = screen_item_id(id);
            let prev_screen = previous.get(&screen_id);

            items.insert(
                screen_id.clone(),
                CallItem {
                    id: screen_id,
                    participant_id: id.clone(),
                    name,
                    has_name_set,
                    is_active_speaker: prev_screen.is_some_and(|item| item.is_active_speaker),
                    is_loading: false,
                    has_loaded: true,
                    is_local: participant.is_local,
                    is_mic_muted: false,
                    is_cam_muted: false,
                    is_owner: false,
                    is_recording: participant.is_recording,
                    is_screenshare: true,
                    muted_by_host: false,
                    last_active_date: prev_screen.and_then(|item| item.last_active_date),
                    joined_at: prev_screen.map_or(now, |item| item.joined_at),
                    audio_track: participant.screen_audio_track.clone(),
                    video_track: participant.screen_video_track.clone(),
                },
            );
        }
    }

    items
}

/// Übernimmt das externe Sprechersignal
///
/// Der Sprecher bekommt `is_active_speaker = true` und `last_active_date =
/// now`; alle anderen verlieren das Flag, behalten aber ihr Datum.
/// Screenshare-Projektionen sind davon nicht betroffen.
pub fn apply_active_speaker(items: &CallItems, speaker_id: &str, now: DateTime<Utc>) -> CallItems {
    items
        .iter()
        .map(|(id, item)| {
            let mut item = item.clone();
            if !item.is_screenshare {
                let is_speaker = item.participant_id == speaker_id;
                item.is_active_speaker = is_speaker;
                if is_speaker {
                    item.last_active_date = Some(now);
                }
            }
            (id.clone(), item)
        })
        .collect()
}

/// Audio-Tracks aller entfernten Items (Eingabe für den Compositor)
pub fn remote_audio_tracks(items: &CallItems) -> Vec<TrackHandle> {
    items
        .values()
        .filter(|item| !item.is_local)
        .filter_map(|item| item.audio_track.clone())
        .collect()
}

/// Anzeigereihenfolge: Screenshares, lokal, zuletzt aktiv, dann Beitrittszeit
pub fn display_order(items: &CallItems) -> Vec<&CallItem> {
    let mut ordered: Vec<&CallItem> = items.values().collect();
    ordered.sort_by(|a, b| {
        b.is_screenshare
            .cmp(&a.is_screenshare)
            .then_with(|| b.is_local.cmp(&a.is_local))
            .then_with(|| match (a.last_active_date, b.last_active_date) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

// ============================================================================
// TESTS
// ============================================================================
