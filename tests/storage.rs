//! Integration tests driving the storage facade directly: registration and
//! authentication, content, the KV operation set, quotas under a manual
//! clock, the MRU listing, and crash-recovery through the persistence log.

use std::path::PathBuf;
use std::sync::Arc;

use locker::protocol::{
    RES_ERR_KEY, RES_ERR_LOGIN, RES_ERR_MSG_FMT, RES_ERR_NO_DATA, RES_ERR_NO_USER,
    RES_ERR_QUOTA, RES_ERR_SO, RES_ERR_USER_EXISTS, LEN_UNAME,
};
use locker::quota::{Clock, ManualClock};
use locker::{OpOutcome, Storage, StorageConfig};

const ADMIN: &str = "alice";
const PW: &str = "alicepw";

fn config(datafile: PathBuf) -> StorageConfig {
    StorageConfig {
        datafile,
        buckets: 4,
        up_quota: 1024,
        down_quota: 4096,
        req_quota: 10_000,
        quota_dur: 60,
        top_size: 4,
        admin: ADMIN.to_string(),
    }
}

fn open(datafile: PathBuf, clock: Arc<dyn Clock>) -> Storage {
    Storage::open_with_clock(config(datafile), clock).unwrap()
}

#[test]
fn registration_is_idempotent_in_effect() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));

    assert_eq!(st.add_user(ADMIN, PW), Ok(OpOutcome::Ok));
    assert_eq!(st.add_user(ADMIN, "other"), Err(RES_ERR_USER_EXISTS));
    // the original password still authenticates, the second attempt changed nothing
    assert!(st.auth(ADMIN, PW));
    assert!(!st.auth(ADMIN, "other"));
    assert!(!st.auth("nobody", PW));
}

#[test]
fn bounds_violations_reject_before_any_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));

    let long_name = "x".repeat(LEN_UNAME + 1);
    assert_eq!(st.add_user(&long_name, PW), Err(RES_ERR_MSG_FMT));
    assert_eq!(st.add_user("", PW), Err(RES_ERR_MSG_FMT));
    assert_eq!(st.add_user("user\nname", PW), Err(RES_ERR_MSG_FMT));
    assert_eq!(st.add_user(ADMIN, ""), Err(RES_ERR_MSG_FMT));

    st.add_user(ADMIN, PW).unwrap();
    assert_eq!(
        st.kv_insert(ADMIN, PW, "", b"v".to_vec()),
        Err(RES_ERR_MSG_FMT)
    );
}

#[test]
fn content_set_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));

    st.add_user(ADMIN, PW).unwrap();
    st.add_user("bob", "bobpw").unwrap();

    assert_eq!(
        st.set_user_data("bob", "bobpw", b"hello".to_vec()),
        Ok(OpOutcome::Ok)
    );
    assert_eq!(
        st.get_user_data(ADMIN, PW, "bob"),
        Ok(OpOutcome::Data(b"hello".to_vec()))
    );
    assert_eq!(st.get_user_data(ADMIN, PW, "carol"), Err(RES_ERR_NO_USER));
    // alice never stored content
    assert_eq!(st.get_user_data("bob", "bobpw", ADMIN), Err(RES_ERR_NO_DATA));
    assert_eq!(
        st.get_user_data(ADMIN, "wrong", "bob"),
        Err(RES_ERR_LOGIN)
    );
}

#[test]
fn kv_crud_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));
    st.add_user("bob", "pw").unwrap();

    assert_eq!(st.kv_insert("bob", "pw", "k", b"v1".to_vec()), Ok(OpOutcome::Ok));
    assert_eq!(
        st.kv_get("bob", "pw", "k"),
        Ok(OpOutcome::Data(b"v1".to_vec()))
    );
    assert_eq!(
        st.kv_insert("bob", "pw", "k", b"v2".to_vec()),
        Err(RES_ERR_KEY)
    );
    assert_eq!(
        st.kv_upsert("bob", "pw", "k", b"v2".to_vec()),
        Ok(OpOutcome::Updated)
    );
    assert_eq!(
        st.kv_get("bob", "pw", "k"),
        Ok(OpOutcome::Data(b"v2".to_vec()))
    );
    assert_eq!(
        st.kv_upsert("bob", "pw", "fresh", b"x".to_vec()),
        Ok(OpOutcome::Inserted)
    );
    assert_eq!(st.kv_delete("bob", "pw", "k"), Ok(OpOutcome::Ok));
    assert_eq!(st.kv_get("bob", "pw", "k"), Err(RES_ERR_KEY));
    // a second delete finds nothing
    assert_eq!(st.kv_delete("bob", "pw", "k"), Err(RES_ERR_KEY));
}

#[test]
fn listings_cover_users_and_keys() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));
    st.add_user(ADMIN, PW).unwrap();
    st.add_user("bob", "pw").unwrap();

    assert_eq!(st.kv_all(ADMIN, PW), Err(RES_ERR_NO_DATA));
    st.kv_insert("bob", "pw", "beta", b"2".to_vec()).unwrap();
    st.kv_insert("bob", "pw", "alpha", b"1".to_vec()).unwrap();

    assert_eq!(
        st.get_all_users(ADMIN, PW),
        Ok(OpOutcome::Data(b"alice\nbob".to_vec()))
    );
    assert_eq!(
        st.kv_all(ADMIN, PW),
        Ok(OpOutcome::Data(b"alpha\nbeta".to_vec()))
    );
}

#[test]
fn upload_quota_trips_at_the_window_sum() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(100);
    let st = open(dir.path().join("data"), Arc::clone(&clock) as Arc<dyn Clock>);
    st.add_user("bob", "pw").unwrap();

    // 1024 one-byte inserts fill the window exactly
    for i in 0..1024 {
        assert_eq!(
            st.kv_insert("bob", "pw", &format!("k{}", i), b"x".to_vec()),
            Ok(OpOutcome::Ok),
            "insert {} should fit the quota",
            i
        );
    }
    assert_eq!(
        st.kv_insert("bob", "pw", "k1024", b"x".to_vec()),
        Err(RES_ERR_QUOTA)
    );
    // nothing was charged for the rejected attempt, and the key never landed
    assert_eq!(st.kv_get("bob", "pw", "k1024"), Err(RES_ERR_KEY));

    clock.advance(61);
    assert_eq!(
        st.kv_insert("bob", "pw", "k1024", b"x".to_vec()),
        Ok(OpOutcome::Ok)
    );
}

#[test]
fn request_quota_limits_cheap_operations_too() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(100);
    let mut cfg = config(dir.path().join("data"));
    cfg.req_quota = 3;
    let st = Storage::open_with_clock(cfg, Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
    st.add_user("bob", "pw").unwrap();
    st.kv_insert("bob", "pw", "k", b"v".to_vec()).unwrap();

    assert!(st.kv_get("bob", "pw", "k").is_ok());
    assert!(st.kv_get("bob", "pw", "k").is_ok());
    assert_eq!(st.kv_get("bob", "pw", "k"), Err(RES_ERR_QUOTA));
    clock.advance(61);
    assert!(st.kv_get("bob", "pw", "k").is_ok());
}

#[test]
fn download_quota_counts_fetched_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(100);
    let mut cfg = config(dir.path().join("data"));
    cfg.down_quota = 5;
    let st = Storage::open_with_clock(cfg, Arc::clone(&clock) as Arc<dyn Clock>).unwrap();
    st.add_user("bob", "pw").unwrap();
    st.kv_insert("bob", "pw", "k", b"abc".to_vec()).unwrap();

    assert!(st.kv_get("bob", "pw", "k").is_ok());
    // a second 3-byte fetch would make 6 of 5
    assert_eq!(st.kv_get("bob", "pw", "k"), Err(RES_ERR_QUOTA));
    clock.advance(61);
    assert!(st.kv_get("bob", "pw", "k").is_ok());
}

#[test]
fn mru_tracks_the_last_distinct_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path().join("data"));
    cfg.top_size = 2;
    let st = Storage::open_with_clock(cfg, ManualClock::new(0)).unwrap();
    st.add_user("bob", "pw").unwrap();

    assert_eq!(st.kv_top("bob", "pw"), Err(RES_ERR_NO_DATA));
    st.kv_insert("bob", "pw", "a", b"1".to_vec()).unwrap();
    st.kv_insert("bob", "pw", "b", b"2".to_vec()).unwrap();
    st.kv_insert("bob", "pw", "c", b"3".to_vec()).unwrap();
    st.kv_get("bob", "pw", "a").unwrap();
    assert_eq!(st.kv_top("bob", "pw"), Ok(OpOutcome::Data(b"a\nc".to_vec())));

    // deleting a key drops it from the listing
    st.kv_delete("bob", "pw", "a").unwrap();
    assert_eq!(st.kv_top("bob", "pw"), Ok(OpOutcome::Data(b"c".to_vec())));
}

#[test]
fn restart_replays_the_incremental_log() {
    let dir = tempfile::tempdir().unwrap();
    let datafile = dir.path().join("data");
    {
        let st = open(datafile.clone(), ManualClock::new(0));
        st.add_user(ADMIN, PW).unwrap();
        st.add_user("bob", "bobpw").unwrap();
        st.set_user_data("bob", "bobpw", b"hello".to_vec()).unwrap();
        st.kv_insert("bob", "bobpw", "k", b"v1".to_vec()).unwrap();
        st.kv_upsert("bob", "bobpw", "k", b"v2".to_vec()).unwrap();
        st.kv_insert("bob", "bobpw", "gone", b"x".to_vec()).unwrap();
        st.kv_delete("bob", "bobpw", "gone").unwrap();
        st.shutdown();
    }

    let st = open(datafile, ManualClock::new(0));
    assert!(st.auth(ADMIN, PW));
    assert!(st.auth("bob", "bobpw"));
    assert!(!st.auth("bob", PW));
    assert_eq!(
        st.get_user_data(ADMIN, PW, "bob"),
        Ok(OpOutcome::Data(b"hello".to_vec()))
    );
    assert_eq!(
        st.kv_get("bob", "bobpw", "k"),
        Ok(OpOutcome::Data(b"v2".to_vec()))
    );
    assert_eq!(st.kv_get("bob", "bobpw", "gone"), Err(RES_ERR_KEY));
}

#[test]
fn snapshot_compacts_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let datafile = dir.path().join("data");
    {
        let st = open(datafile.clone(), ManualClock::new(0));
        st.add_user(ADMIN, PW).unwrap();
        st.add_user("bob", "bobpw").unwrap();
        for i in 0..20 {
            st.kv_upsert("bob", "bobpw", "churn", format!("v{}", i).into_bytes())
                .unwrap();
        }
        st.kv_insert("bob", "bobpw", "keep", b"kept".to_vec()).unwrap();

        // only the admin may snapshot
        assert_eq!(st.save("bob", "bobpw"), Err(RES_ERR_LOGIN));
        assert_eq!(st.save(ADMIN, PW), Ok(OpOutcome::Ok));
        let compacted = std::fs::metadata(&datafile).unwrap().len();

        // appends keep working on the reopened handle
        st.kv_insert("bob", "bobpw", "after", b"tail".to_vec()).unwrap();
        assert!(std::fs::metadata(&datafile).unwrap().len() > compacted);
        st.shutdown();
    }

    let st = open(datafile, ManualClock::new(0));
    assert_eq!(
        st.kv_get("bob", "bobpw", "churn"),
        Ok(OpOutcome::Data(b"v19".to_vec()))
    );
    assert_eq!(
        st.kv_get("bob", "bobpw", "keep"),
        Ok(OpOutcome::Data(b"kept".to_vec()))
    );
    assert_eq!(
        st.kv_get("bob", "bobpw", "after"),
        Ok(OpOutcome::Data(b"tail".to_vec()))
    );
    assert!(st.auth("bob", "bobpw"));
}

#[test]
fn functions_register_and_execute_over_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let st = open(dir.path().join("data"), ManualClock::new(0));
    st.add_user(ADMIN, PW).unwrap();
    st.add_user("bob", "pw").unwrap();
    st.kv_insert("bob", "pw", "a", b"12".to_vec()).unwrap();
    st.kv_insert("bob", "pw", "b", b"345".to_vec()).unwrap();

    let script = b"#!/bin/sh\nwc -c\n".to_vec();
    // registration is admin-only
    assert_eq!(
        st.register_fn("bob", "pw", "bytecount", script.clone()),
        Err(RES_ERR_LOGIN)
    );
    assert_eq!(
        st.register_fn(ADMIN, PW, "bytecount", script.clone()),
        Ok(OpOutcome::Ok)
    );
    assert_eq!(
        st.register_fn(ADMIN, PW, "bytecount", script),
        Err(RES_ERR_SO)
    );

    // any user may invoke: pairs are framed as 4+klen+4+vlen bytes each
    let out = match st.invoke_fn("bob", "pw", "bytecount") {
        Ok(OpOutcome::Data(out)) => out,
        other => panic!("unexpected invoke result: {:?}", other),
    };
    let count: u64 = String::from_utf8(out).unwrap().trim().parse().unwrap();
    assert_eq!(count, (4 + 1 + 4 + 2) + (4 + 1 + 4 + 3));

    assert_eq!(st.invoke_fn("bob", "pw", "missing"), Err(RES_ERR_SO));
}

#[test]
fn concurrent_upserts_settle_on_one_writer() {
    let dir = tempfile::tempdir().unwrap();
    let st = Arc::new(open(dir.path().join("data"), ManualClock::new(0)));
    st.add_user("bob", "pw").unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let st = Arc::clone(&st);
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                st.kv_upsert("bob", "pw", "hot", format!("t{}i{}", t, i).into_bytes())
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // the final value is one complete written value, never a torn mix
    let value = match st.kv_get("bob", "pw", "hot") {
        Ok(OpOutcome::Data(v)) => String::from_utf8(v).unwrap(),
        other => panic!("unexpected get result: {:?}", other),
    };
    assert!(value.starts_with('t'), "torn value: {}", value);
    let mut parts = value[1..].splitn(2, 'i');
    let t: u32 = parts.next().unwrap().parse().unwrap();
    let i: u32 = parts.next().unwrap().parse().unwrap();
    assert!(t < 4 && i < 50, "torn value: {}", value);
}
