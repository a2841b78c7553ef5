//! The unlink command: stripping stack metadata so commits submit as new
//! requests.

mod common;

use common::harness;
use ghstack::diff::GhNumber;
use ghstack::submit::Action;
use ghstack::unlink;

#[test]
fn unlink_strips_metadata_and_frees_the_commits() {
    let h = harness();
    let c1 = h.git.commit(&[&h.main_tip], "t1", "Add frobnicator\n\nDetails.");
    h.git.checkout("feature", &c1);
    h.submit().unwrap();

    let linked = h.git.head();
    unlink::run(&h.git, "main", "refs/heads/feature").unwrap();

    let tip = h.git.head();
    assert_ne!(tip, linked);
    let message = h.git.commit_record(&tip).message;
    assert!(!message.contains("ghstack-source-id"));
    assert!(!message.contains("Pull-Request"));
    assert_eq!(message, "Add frobnicator\n\nDetails.");

    // Resubmission opens a fresh request in the next free slot.
    let report = h.submit().unwrap();
    assert_eq!(report.decisions[0].action, Action::Created);
    assert_eq!(report.decisions[0].number, 101);
    assert_eq!(report.decisions[0].ghnum, GhNumber(2));
}

#[test]
fn unlink_without_metadata_leaves_the_branch_alone() {
    let h = harness();
    let c1 = h.git.commit(&[&h.main_tip], "t1", "Plain commit");
    h.git.checkout("feature", &c1);

    unlink::run(&h.git, "main", "refs/heads/feature").unwrap();
    assert_eq!(h.git.head(), c1);
}

#[test]
fn unlink_strips_legacy_trailer_spellings() {
    let h = harness();
    let c1 = h.git.commit(
        &[&h.main_tip],
        "t1",
        "Old commit\n\nPull Request resolved: https://github.com/alice/proj/pull/3\n\
         gh-metadata: alice proj 3 gh/alice/1/head",
    );
    h.git.checkout("feature", &c1);

    unlink::run(&h.git, "main", "refs/heads/feature").unwrap();
    let message = h.git.commit_record(&h.git.head()).message;
    assert_eq!(message, "Old commit");
}
