// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! One-shot migration from the legacy schema (spec §6 "Migration").
//!
//! The legacy schema kept the live/most-recent stream's id and title as
//! columns on a per-channel row (`active_id`, `active_title`) rather than
//! giving every stream its own `activated_time`. Grounded on the teacher's
//! `db::upgrade` module shape (a sequence of numbered steps driven from the
//! `migrate` subcommand), reduced to the single step this spec names.

use base::strutil::parse_epoch_secs;
use rusqlite::Connection;
use tracing::info;

/// Runs the legacy-schema migration against an already-open connection
/// whose `streams` table still has the old `active_id`/`active_title`
/// columns and no `activated_time`. No-op (returns `Ok(false)`) if the
/// legacy table isn't present, so this is safe to call unconditionally
/// before `Database::open`.
pub fn migrate_legacy_schema(conn: &mut Connection) -> Result<bool, base::Error> {
    let has_legacy: i32 = conn.query_row(
        "select count(*) from sqlite_master where name = 'streams'",
        [],
        |r| r.get(0),
    )?;
    if has_legacy == 0 {
        return Ok(false);
    }

    info!("migrating legacy `streams` table to the current schema");
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("../schema.sql"))?;

    struct LegacyRow {
        channel_id: String,
        active_id: String,
        title: Option<String>,
        start_time: Option<String>,
        is_live: bool,
        media_type: Option<String>,
    }

    let rows: Vec<LegacyRow> = {
        let mut stmt = tx.prepare(
            "select channel_id, active_id, stream_title, start_time, is_live, media_type from streams",
        )?;
        stmt.query_map([], |r| {
            Ok(LegacyRow {
                channel_id: r.get(0)?,
                active_id: r.get(1)?,
                title: r.get(2)?,
                start_time: r.get(3)?,
                is_live: r.get::<_, i64>(4)? != 0,
                media_type: r.get(5)?,
            })
        })?
        .collect::<Result<_, _>>()?
    };

    for row in rows {
        let activated_time = row
            .start_time
            .as_deref()
            .and_then(parse_epoch_secs)
            .unwrap_or(0);
        tx.execute(
            "insert into channel (key, base_media_folder, num_past_streams)
             values (?1, '', 5)
             on conflict (key) do nothing",
            [&row.channel_id],
        )?;
        tx.execute(
            "insert into stream
               (channel_key, stream_id, title, start_time, is_live, media_type, activated_time)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             on conflict (channel_key, stream_id) do nothing",
            rusqlite::params![
                row.channel_id,
                row.active_id,
                row.title.unwrap_or_default(),
                row.start_time.unwrap_or_default(),
                row.is_live,
                row.media_type.as_deref().unwrap_or("none"),
                activated_time,
            ],
        )?;
    }

    tx.execute("drop table streams", [])?;
    tx.commit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_legacy_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table streams (
                channel_id text,
                active_id text,
                stream_title text,
                start_time text,
                is_live integer,
                media_type text
            );
            insert into streams values
                ('ch1', 's1', 'Stream One', '1700000000', 1, 'audio');",
        )
        .unwrap();

        assert!(migrate_legacy_schema(&mut conn).unwrap());

        let (stream_id, activated_time, is_live): (String, i64, bool) = conn
            .query_row(
                "select stream_id, activated_time, is_live from stream where channel_key = 'ch1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(stream_id, "s1");
        assert_eq!(activated_time, 1_700_000_000);
        assert!(is_live);
    }

    #[test]
    fn no_legacy_table_is_a_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(!migrate_legacy_schema(&mut conn).unwrap());
    }
}
