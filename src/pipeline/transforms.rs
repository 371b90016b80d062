//! In-memory answers to the statements in [`super::sql`], used with
//! [`MemoryWarehouse`](crate::MemoryWarehouse) so the pipeline can run without a
//! warehouse. Column lookups ignore case, matching how `COPY` folds JSON keys.

use crate::memory::{Row, Tables};
use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

static NULL: Value = Value::Null;

pub fn songplays(tables: &Tables) -> Vec<Row> {
    let songs = table(tables, "staging_songs");

    next_song_events(tables)
        .filter_map(|event| {
            let start_time = event_time(event)?;
            let song = songs.iter().find(|song| {
                same_text(field(event, "song"), field(song, "title"))
                    && same_text(field(event, "artist"), field(song, "artist_name"))
                    && same_number(field(event, "length"), field(song, "duration"))
            });
            let song_field = |name: &str| song.map_or(Value::Null, |s| field(s, name).clone());
            let session_id = field(event, "sessionid");

            Some(row([
                (
                    "songplay_id",
                    Value::String(format!("{}-{start_time}", text(session_id))),
                ),
                ("start_time", Value::String(start_time)),
                ("user_id", field(event, "userid").clone()),
                ("level", field(event, "level").clone()),
                ("song_id", song_field("song_id")),
                ("artist_id", song_field("artist_id")),
                ("session_id", session_id.clone()),
                ("location", field(event, "location").clone()),
                ("user_agent", field(event, "useragent").clone()),
            ]))
        })
        .collect()
}

pub fn users(tables: &Tables) -> Vec<Row> {
    distinct(next_song_events(tables).map(|event| {
        row([
            ("user_id", field(event, "userid").clone()),
            ("first_name", field(event, "firstname").clone()),
            ("last_name", field(event, "lastname").clone()),
            ("gender", field(event, "gender").clone()),
            ("level", field(event, "level").clone()),
        ])
    }))
}

pub fn songs(tables: &Tables) -> Vec<Row> {
    distinct(table(tables, "staging_songs").iter().map(|song| {
        row([
            ("song_id", field(song, "song_id").clone()),
            ("title", field(song, "title").clone()),
            ("artist_id", field(song, "artist_id").clone()),
            ("year", field(song, "year").clone()),
            ("duration", field(song, "duration").clone()),
        ])
    }))
}

pub fn artists(tables: &Tables) -> Vec<Row> {
    distinct(table(tables, "staging_songs").iter().map(|song| {
        row([
            ("artist_id", field(song, "artist_id").clone()),
            ("name", field(song, "artist_name").clone()),
            ("location", field(song, "artist_location").clone()),
            ("latitude", field(song, "artist_latitude").clone()),
            ("longitude", field(song, "artist_longitude").clone()),
        ])
    }))
}

pub fn time(tables: &Tables) -> Vec<Row> {
    table(tables, "songplays")
        .iter()
        .filter_map(|songplay| {
            let raw = field(songplay, "start_time").as_str()?;
            let at = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
            Some(row([
                ("start_time", Value::String(raw.to_string())),
                ("hour", at.hour().into()),
                ("day", at.day().into()),
                ("week", at.iso_week().week().into()),
                ("month", at.month().into()),
                ("year", at.year().into()),
                ("weekday", at.weekday().num_days_from_sunday().into()),
            ]))
        })
        .collect()
}

fn table<'a>(tables: &'a Tables, name: &str) -> &'a [Row] {
    tables.get(name).map(Vec::as_slice).unwrap_or_default()
}

fn next_song_events(tables: &Tables) -> impl Iterator<Item = &Row> {
    table(tables, "staging_events")
        .iter()
        .filter(|event| field(event, "page").as_str() == Some("NextSong"))
}

fn field<'a>(row: &'a Row, name: &str) -> &'a Value {
    row.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map_or(&NULL, |(_, value)| value)
}

/// `ts` is epoch milliseconds.
fn event_time(event: &Row) -> Option<String> {
    let ts = field(event, "ts");
    let millis = ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64))?;
    let at = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn same_text(left: &Value, right: &Value) -> bool {
    !left.is_null() && left == right
}

fn same_number(left: &Value, right: &Value) -> bool {
    matches!((left.as_f64(), right.as_f64()), (Some(l), Some(r)) if l == r)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn row<const N: usize>(columns: [(&str, Value); N]) -> Row {
    columns
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn distinct(rows: impl Iterator<Item = Row>) -> Vec<Row> {
    let mut seen = BTreeSet::new();
    rows.filter(|row| seen.insert(Value::Object(row.clone()).to_string()))
        .collect()
}
