//! User and group name lookups for tar headers.
//!
//! Headers with a `ustar` magic carry symbolic `uname`/`gname` fields that
//! take precedence over the numeric ids; conversely, emitted headers want
//! the names for the node's uid/gid. Lookups go through the system
//! databases and are memoised one entry deep — archives overwhelmingly
//! carry a single owner, so a cache of one removes nearly all calls.

use std::sync::Mutex;

use nix::unistd::{Gid, Group, Uid, User};

static UID_CACHE: Mutex<Option<(String, u32)>> = Mutex::new(None);
static GID_CACHE: Mutex<Option<(String, u32)>> = Mutex::new(None);
static UNAME_CACHE: Mutex<Option<(u32, String)>> = Mutex::new(None);
static GNAME_CACHE: Mutex<Option<(u32, String)>> = Mutex::new(None);

/// Resolves a user name to a uid, falling back to the current uid when the
/// name is unknown to the system databases.
pub fn uid_for_name(name: &str) -> u32 {
    let mut cache = UID_CACHE.lock().unwrap();
    if let Some((cached, uid)) = cache.as_ref() {
        if cached == name {
            return *uid;
        }
    }
    let uid = match User::from_name(name) {
        Ok(Some(user)) => user.uid.as_raw(),
        _ => Uid::current().as_raw(),
    };
    *cache = Some((name.to_owned(), uid));
    uid
}

/// Resolves a group name to a gid, falling back to the current gid.
pub fn gid_for_name(name: &str) -> u32 {
    let mut cache = GID_CACHE.lock().unwrap();
    if let Some((cached, gid)) = cache.as_ref() {
        if cached == name {
            return *gid;
        }
    }
    let gid = match Group::from_name(name) {
        Ok(Some(group)) => group.gid.as_raw(),
        _ => Gid::current().as_raw(),
    };
    *cache = Some((name.to_owned(), gid));
    gid
}

/// Returns the user name for a uid, or an empty string when the uid has no
/// passwd entry (the header field is then left blank).
pub fn name_for_uid(uid: u32) -> String {
    let mut cache = UNAME_CACHE.lock().unwrap();
    if let Some((cached, name)) = cache.as_ref() {
        if *cached == uid {
            return name.clone();
        }
    }
    let name = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => String::new(),
    };
    *cache = Some((uid, name.clone()));
    name
}

/// Returns the group name for a gid, or an empty string when unknown.
pub fn name_for_gid(gid: u32) -> String {
    let mut cache = GNAME_CACHE.lock().unwrap();
    if let Some((cached, name)) = cache.as_ref() {
        if *cached == gid {
            return name.clone();
        }
    }
    let name = match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => String::new(),
    };
    *cache = Some((gid, name.clone()));
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_falls_back_to_current_ids() {
        assert_eq!(
            uid_for_name("__no_such_tarfs_user__"),
            Uid::current().as_raw()
        );
        assert_eq!(
            gid_for_name("__no_such_tarfs_group__"),
            Gid::current().as_raw()
        );
    }

    #[test]
    fn uid_zero_resolves_to_root_on_unix() {
        // Every Unix system has uid 0; the reverse mapping must agree.
        let name = name_for_uid(0);
        if !name.is_empty() {
            assert_eq!(uid_for_name(&name), 0);
        }
    }
}
