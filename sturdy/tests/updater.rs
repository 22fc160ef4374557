// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests driving the updater against complete signed
//! authentication repositories and their target repositories.

mod test_utils;

use sturdy::error::Error;
use sturdy::git::{CommitId, GitRepo};
use sturdy::{clone_repository, update_repository, validate_repository};
use sturdy::{AuthRepo, Event, UpdateOptions};
use tempfile::TempDir;
use test_utils::{AuthRepoFixture, TargetRepoFixture};

const AUTH_NAME: &str = "org/law";

/// A remote library (authentication repository plus two target
/// repositories) and an empty client directory.
struct World {
    remotes: TempDir,
    client: TempDir,
    auth: AuthRepoFixture,
    target1: TargetRepoFixture,
    target2: TargetRepoFixture,
    auth_commits: Vec<CommitId>,
}

impl World {
    /// Three pin-advancing authentication commits over two target
    /// repositories.
    fn create(allow_unauthenticated: bool) -> World {
        Self::create_inner(allow_unauthenticated, false)
    }

    fn create_inner(allow_unauthenticated: bool, delegated: bool) -> World {
        let remotes = TempDir::new().unwrap();
        let client = TempDir::new().unwrap();

        let target1 = TargetRepoFixture::create(&remotes.path().join("ns/target1"), "ns/target1");
        let t1 = vec![
            target1.commit_file("f1", "one", "first"),
            target1.commit_file("f2", "two", "second"),
            target1.commit_file("f3", "three", "third"),
        ];
        let target2 = TargetRepoFixture::create(&remotes.path().join("ns/target2"), "ns/target2");
        let t2 = vec![
            target2.commit_file("g1", "one", "first"),
            target2.commit_file("g2", "two", "second"),
        ];

        let mut auth = AuthRepoFixture::create(&remotes.path().join(AUTH_NAME), "org", "law");
        if delegated {
            auth = auth.with_delegated_pins_role();
        }
        auth.set_repositories(&[
            ("ns/target1", &target1.url(), allow_unauthenticated),
            ("ns/target2", &target2.url(), allow_unauthenticated),
        ]);
        auth.pin("ns/target1", "main", &t1[0]);
        auth.pin("ns/target2", "main", &t2[0]);
        let c1 = auth.commit("initial pins");
        auth.pin("ns/target1", "main", &t1[1]);
        auth.pin("ns/target2", "main", &t2[1]);
        let c2 = auth.commit("advance both targets");
        auth.pin("ns/target1", "main", &t1[2]);
        let c3 = auth.commit("advance target1");

        World {
            remotes,
            client,
            auth,
            target1,
            target2,
            auth_commits: vec![c1, c2, c3],
        }
    }

    fn options(&self) -> UpdateOptions {
        UpdateOptions::new(self.client.path())
    }

    fn client_auth(&self) -> AuthRepo {
        AuthRepo::new(self.client.path(), AUTH_NAME, Vec::new(), None)
    }

    fn client_target(&self, name: &str) -> GitRepo {
        GitRepo::new(self.client.path().join(name), name, Vec::new())
    }

    fn watermark(&self) -> Option<CommitId> {
        self.client_auth().last_validated_commit().unwrap()
    }
}

#[test]
fn happy_clone_checks_out_pinned_state() {
    let world = World::create(false);
    let result = clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    assert_eq!(result.event, Event::Changed);
    assert_eq!(result.root.event, Event::Changed);
    assert!(result.root.error.is_none());
    assert_eq!(result.root.commits.new, world.auth_commits);

    // Both target repositories are checked out at the last pinned commit.
    let target1 = world.client_target("ns/target1");
    assert_eq!(
        target1.head_commit(Some("main")).unwrap().unwrap(),
        world.target1.head()
    );
    assert!(world.client.path().join("ns/target1/f3").exists());
    let target2 = world.client_target("ns/target2");
    assert_eq!(
        target2.head_commit(Some("main")).unwrap().unwrap(),
        world.target2.head()
    );

    // The watermark equals the authentication repository's head.
    assert_eq!(world.watermark().unwrap(), world.auth.head());
}

#[test]
fn noop_update_changes_nothing() {
    let world = World::create(false);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();
    let tip_before = world
        .client_target("ns/target1")
        .head_commit(Some("main"))
        .unwrap();

    let result =
        update_repository(&world.auth.url(), Some(AUTH_NAME), &world.options()).unwrap();

    assert_eq!(result.event, Event::Unchanged);
    assert!(result.root.commits.new.is_empty());
    assert_eq!(
        world
            .client_target("ns/target1")
            .head_commit(Some("main"))
            .unwrap(),
        tip_before
    );
    assert_eq!(world.watermark().unwrap(), world.auth.head());
}

#[test]
fn unauthorized_extra_commit_fails_the_update() {
    let world = World::create(false);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();
    let pinned_tip = world.target1.head();

    // A commit that no authentication commit accounts for.
    world.target1.commit_file("rogue", "x", "unauthorized");

    let result =
        update_repository(&world.auth.url(), Some(AUTH_NAME), &world.options()).unwrap();

    assert_eq!(result.root.event, Event::Failed);
    match result.root.error {
        Some(Error::TargetMismatch { ref repo, .. }) => assert_eq!(repo, "ns/target1"),
        ref other => panic!("expected a target mismatch, got {:?}", other),
    }
    // Neither the watermark nor the local branch moved.
    assert_eq!(world.watermark().unwrap(), world.auth.head());
    assert_eq!(
        world
            .client_target("ns/target1")
            .head_commit(Some("main"))
            .unwrap()
            .unwrap(),
        pinned_tip
    );
}

#[test]
fn authorized_extra_commit_advances_the_branch() {
    let world = World::create(true);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    let extra = world.target1.commit_file("extra", "x", "unauthenticated but allowed");
    let result =
        update_repository(&world.auth.url(), Some(AUTH_NAME), &world.options()).unwrap();

    assert_eq!(result.root.event, Event::Changed);
    assert_eq!(
        world
            .client_target("ns/target1")
            .head_commit(Some("main"))
            .unwrap()
            .unwrap(),
        extra
    );
    // The watermark still covers the full authentication history.
    assert_eq!(world.watermark().unwrap(), world.auth.head());
}

#[test]
fn invalid_timestamp_accepts_the_good_prefix() {
    let mut world = World::create(false);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    // One more good commit, then one with a corrupted timestamp signature.
    let t1d = world.target1.commit_file("f4", "four", "fourth");
    world.auth.pin("ns/target1", "main", &t1d);
    let good = world.auth.commit("advance target1 again");
    world.auth.pin("ns/target2", "main", &world.target2.head());
    let bad = world.auth.commit_with_bad_timestamp("bad timestamp");

    let result =
        update_repository(&world.auth.url(), Some(AUTH_NAME), &world.options()).unwrap();

    assert_eq!(result.root.event, Event::Failed);
    match result.root.error {
        Some(Error::Metadata { ref role, .. }) => assert_eq!(role, "timestamp"),
        ref other => panic!("expected a metadata error, got {:?}", other),
    }
    // Everything up to the last good commit was applied.
    assert_eq!(world.watermark().unwrap(), good);
    assert_ne!(world.watermark().unwrap(), bad);
    assert_eq!(
        world
            .client_target("ns/target1")
            .head_commit(Some("main"))
            .unwrap()
            .unwrap(),
        t1d
    );
}

#[test]
fn out_of_band_mismatch_leaves_no_clone() {
    let world = World::create(false);
    let wrong: CommitId = "0000000000000000000000000000000000000001".parse().unwrap();

    let result = clone_repository(&world.auth.url(), Some(wrong), &world.options()).unwrap();

    assert_eq!(result.root.event, Event::Failed);
    assert!(matches!(
        result.root.error,
        Some(Error::OutOfBandMismatch { .. })
    ));
    assert!(!world.client.path().join(AUTH_NAME).exists());
    assert_eq!(world.watermark(), None);
}

#[test]
fn out_of_band_match_is_accepted() {
    let world = World::create(false);
    let result = clone_repository(
        &world.auth.url(),
        Some(world.auth_commits[0].clone()),
        &world.options(),
    )
    .unwrap();
    assert_eq!(result.root.event, Event::Changed);
    assert_eq!(world.watermark().unwrap(), world.auth.head());
}

#[test]
fn excluded_targets_freeze_the_watermark() {
    let world = World::create(false);
    let mut options = world.options();
    options.excluded_target_globs = vec!["ns/*".to_owned()];

    let result = clone_repository(&world.auth.url(), None, &options).unwrap();

    assert_eq!(result.root.event, Event::Changed);
    // Excluded repositories are neither cloned nor validated, and a partial
    // view must not advance the watermark.
    assert!(!world.client.path().join("ns/target1").exists());
    assert_eq!(world.watermark(), None);
}

#[test]
fn validate_only_mutates_nothing() {
    let world = World::create(false);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    let auth_path = world.client.path().join(AUTH_NAME);
    let result = validate_repository(&auth_path, None, &world.options()).unwrap();
    assert_eq!(result.root.event, Event::Unchanged);
    assert_eq!(world.watermark().unwrap(), world.auth.head());
}

#[test]
fn delegated_roles_sign_repository_pins() {
    let world = World::create_inner(false, true);
    let result = clone_repository(&world.auth.url(), None, &world.options()).unwrap();
    assert_eq!(result.root.event, Event::Changed);

    let auth = world.client_auth();
    let head = world.auth.head();
    let roles = auth.all_target_roles_at(&head).unwrap();
    assert_eq!(roles, vec!["targets".to_owned(), "pins".to_owned()]);
    assert_eq!(
        auth.role_for_target_path(&head, "ns/target1").unwrap(),
        "pins"
    );
    assert_eq!(
        auth.role_for_target_path(&head, "repositories.json").unwrap(),
        "targets"
    );
}

#[test]
fn auth_repo_queries_cover_pin_history() {
    let world = World::create(false);
    clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    let auth = world.client_auth();
    let head = world.auth.head();

    let (descriptor, body) = auth
        .target_descriptor(&head, "ns/target1")
        .unwrap()
        .expect("target1 is a signed target");
    let body = body.expect("repository targets are JSON");
    assert_eq!(
        body.get("commit").and_then(|v| v.as_str()).unwrap(),
        world.target1.head().as_str()
    );
    assert!(descriptor.length > 0);

    // Every pinned commit is authenticated; an arbitrary one is not.
    assert!(auth
        .is_commit_authenticated("ns/target1", &world.target1.head())
        .unwrap());
    let bogus: CommitId = "00000000000000000000000000000000000000aa".parse().unwrap();
    assert!(!auth.is_commit_authenticated("ns/target1", &bogus).unwrap());
}

#[test]
fn lifecycle_scripts_record_persistent_state() {
    let mut world = World::create(false);
    world.auth.set_target_bytes(
        "scripts/repo/succeeded/00-record.sh",
        b"#!/bin/sh\ncat > /dev/null\nprintf '{\"persistent\": {\"last_event\": \"succeeded\"}, \"transient\": {}}'\n"
            .to_vec(),
    );
    world.auth.commit("add succeeded handler");

    clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    let persistent = std::fs::read_to_string(world.client.path().join("persistent.json")).unwrap();
    let persistent: serde_json::Value = serde_json::from_str(&persistent).unwrap();
    assert_eq!(persistent["last_event"], "succeeded");
}

#[test]
fn dependencies_are_walked_with_cycles_skipped() {
    let world = World::create(false);
    let remotes = world.remotes.path();

    // A dependency repository that in turn names its parent, forming a
    // cycle the walker must skip.
    let mut child = AuthRepoFixture::create(&remotes.join("org/child"), "org", "child");
    let parent_first = world.auth_commits[0].clone();
    child.set_dependencies(&[("org/law", &parent_first)]);
    let child_head = child.commit("initial");

    let mut world = world;
    world.auth.set_dependencies(&[("org/child", &child_head)]);
    world.auth.commit("declare dependency");

    let result = clone_repository(&world.auth.url(), None, &world.options()).unwrap();

    assert_eq!(result.root.event, Event::Changed);
    let child_output = result
        .dependencies
        .get("org/child")
        .expect("dependency was updated");
    assert_eq!(child_output.event, Event::Changed);
    assert!(world.client.path().join("org/child").exists());
    let child_auth = AuthRepo::new(world.client.path(), "org/child", Vec::new(), None);
    assert_eq!(
        child_auth.last_validated_commit().unwrap().unwrap(),
        child_head
    );
}
