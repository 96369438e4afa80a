//! End-to-end checks of the editor, reporter, session and commit queue
//! contracts through the public API.

#![allow(clippy::unwrap_used)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use proptest::prelude::*;
use svn_delta::transport::wire::{decode_commands, encode_commands};
use svn_delta::transport::{CommandRecorder, EditorCommand, replay_commands};
use svn_delta::{
    CommitInfo, CommitOptions, CommitQueue, DeltaGenerator, DeltaOp, DeltaWindow, Depth,
    DriveOptions, Editor, MemRepository, MemWcAdmin, QueueItemOptions, RaSession, Report, Reporter,
    Repository, SvnError, TextDeltaApplier, Tree, TreeEditor, UpdateOptions, WcAdmin, WcContext,
    crawl_revisions, drive_tree_delta, md5_hex,
};

fn assert_protocol<T: std::fmt::Debug>(res: Result<T, SvnError>) -> String {
    match res {
        Err(SvnError::Protocol(msg)) => msg,
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[test]
fn hello_tree_is_built_end_to_end() {
    let mut consumer = TreeEditor::new(Tree::new());
    {
        let mut editor = Editor::new(&mut consumer);
        let mut d0 = editor.open_root(None).unwrap();
        let mut d1 = d0.add_directory("trunk", None).unwrap();
        let mut f0 = d1.add_file("trunk/README", None).unwrap();
        let mut h0 = f0.apply_textdelta(None).unwrap();
        h0.send(Some(&DeltaWindow::insertion(b"hello".to_vec()))).unwrap();
        h0.send(None).unwrap();
        f0.close(Some(md5_hex(b"hello").as_str())).unwrap();
        d1.close().unwrap();
        d0.close().unwrap();
        editor.close().unwrap();
    }
    let tree = consumer.into_tree();
    assert_eq!(tree.paths(), vec!["trunk".to_string(), "trunk/README".to_string()]);
    assert_eq!(tree.file("trunk/README").unwrap().contents, b"hello");
}

#[test]
fn closing_a_parent_with_an_open_child_is_rejected() {
    let mut consumer = TreeEditor::new(Tree::new());
    {
        let mut editor = Editor::new(&mut consumer);
        let mut d0 = editor.open_root(None).unwrap();
        let mut d1 = d0.add_directory("trunk", None).unwrap();
        let mut f0 = d1.add_file("trunk/README", None).unwrap();
        let mut h0 = f0.apply_textdelta(None).unwrap();
        h0.send(Some(&DeltaWindow::insertion(b"hello".to_vec()))).unwrap();
        h0.finish().unwrap();
        f0.close(None).unwrap();

        let msg = assert_protocol(d0.close());
        assert!(msg.contains("still open"), "{msg}");
        assert_protocol(editor.close());

        d1.close().unwrap();
        d0.close().unwrap();
        editor.close().unwrap();
    }
    assert_eq!(consumer.into_tree().file("trunk/README").unwrap().contents, b"hello");
}

#[test]
fn abort_is_legal_with_children_open() {
    let mut recorder = CommandRecorder::new();
    {
        let mut editor = Editor::new(&mut recorder);
        let mut d0 = editor.open_root(None).unwrap();
        let mut d1 = d0.add_directory("a", None).unwrap();
        let mut f0 = d1.add_file("a/f", None).unwrap();
        let _h0 = f0.apply_textdelta(None).unwrap();
        d0.abort().unwrap();

        assert_protocol(f0.close(None));
        assert_protocol(d1.add_directory("a/b", None));
        assert_protocol(editor.close());
        assert!(!editor.is_open());
    }
    let aborts = recorder
        .commands()
        .iter()
        .filter(|cmd| matches!(cmd, EditorCommand::AbortEdit))
        .count();
    assert_eq!(aborts, 1);
    assert_eq!(recorder.commands().last(), Some(&EditorCommand::AbortEdit));
}

#[test]
fn reporter_calls_after_finish_are_rejected() {
    let mut report = Report::new();
    let mut reporter = Reporter::new(&mut report);
    reporter.set_path("", 5, false, None, Depth::Infinity).unwrap();
    reporter.finish().unwrap();
    let msg = assert_protocol(reporter.set_path("foo", 5, false, None, Depth::Infinity));
    assert!(msg.contains("already finished"), "{msg}");
    assert_protocol(reporter.abort());
}

#[test]
fn windows_replayed_out_of_order_diverge() {
    let base = b"abcdef".to_vec();
    let first = DeltaWindow::insertion(b"hello".to_vec());
    let second = DeltaWindow::from_ops(
        0,
        3,
        vec![DeltaOp::source(0, 3), DeltaOp::target(0, 3)],
        Vec::new(),
    );

    let apply = |windows: [&DeltaWindow; 2]| {
        let mut applier = TextDeltaApplier::new("f", base.clone());
        for window in windows {
            applier.apply(window).unwrap();
        }
        applier.finish().0
    };
    let in_order = apply([&first, &second]);
    assert_eq!(in_order, b"helloabcabc");
    assert_eq!(apply([&first, &second]), in_order);
    assert_ne!(apply([&second, &first]), in_order);
}

fn sample_tree() -> Tree {
    let mut tree = Tree::new();
    tree.put_file("trunk/README", "hello\n").unwrap();
    tree.put_file("trunk/src/big.bin", (0..250_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>())
        .unwrap();
    tree.put_file("trunk/empty", Vec::new()).unwrap();
    tree.mkdir_p("tags").unwrap();
    tree.set_prop("trunk", "svn:ignore", Some(b"target\n".to_vec())).unwrap();
    tree.set_prop("trunk/README", "svn:eol-style", Some(b"native".to_vec())).unwrap();
    tree
}

#[test]
fn edit_round_trips_through_the_wire_codec() {
    let target = sample_tree();
    let mut recorder = CommandRecorder::new();
    {
        let mut editor = Editor::new(&mut recorder);
        drive_tree_delta(&mut editor, &Tree::new(), &target, &DriveOptions::new()).unwrap();
    }
    let bytes = encode_commands(recorder.commands()).unwrap();
    let commands = decode_commands(&bytes).unwrap();
    assert_eq!(commands, recorder.into_commands());

    let mut consumer = TreeEditor::new(Tree::new());
    {
        let mut editor = Editor::new(&mut consumer);
        replay_commands(&mut editor, commands).unwrap();
    }
    assert_eq!(consumer.into_tree(), target);
}

fn repository() -> Arc<MemRepository> {
    let repo = MemRepository::new();
    let tree = sample_tree();
    repo.commit_with("alice", "import", |txn| {
        txn.tree = tree;
        Ok(())
    })
    .unwrap();
    Arc::new(repo)
}

#[test]
fn busy_session_refuses_a_second_operation_until_the_first_ends() {
    let repo: Arc<dyn Repository> = repository();
    let session = RaSession::open(repo, "").unwrap();

    let mut reporter = session
        .do_update(&UpdateOptions::new("", Depth::Infinity), CommandRecorder::new())
        .unwrap();
    let err = session
        .do_update(&UpdateOptions::new("", Depth::Infinity), CommandRecorder::new())
        .unwrap_err();
    assert!(matches!(err, SvnError::Busy(_)));

    reporter.set_path("", 0, true, None, Depth::Infinity).unwrap();
    reporter.finish().unwrap();
    assert_eq!(session.latest_revnum().unwrap(), 1);

    let editor = session
        .commit_editor(&CommitOptions::new("x"), |_: &CommitInfo| Ok(()))
        .unwrap();
    assert!(matches!(session.check_path("trunk", None), Err(SvnError::Busy(_))));
    drop(editor);
    assert!(session.check_path("trunk", None).is_ok());
}

#[test]
fn commit_then_update_another_working_copy() {
    let repo = repository();
    let dyn_repo: Arc<dyn Repository> = repo.clone();
    let session = RaSession::open(dyn_repo, "trunk").unwrap().with_username("bob");
    let checkout = repo.tree_at(1).unwrap().subtree("trunk").unwrap();

    let mut committed = None;
    {
        let mut editor = session
            .commit_editor(&CommitOptions::new("tweak readme"), |info: &CommitInfo| {
                committed = Some(info.new_rev);
                Ok(())
            })
            .unwrap();
        let mut root = editor.open_root(Some(1)).unwrap();
        let mut readme = root.open_file("README", Some(1)).unwrap();
        let mut handler = readme.apply_textdelta(Some(md5_hex(b"hello\n").as_str())).unwrap();
        let windows = DeltaGenerator::default().delta_windows(b"hello\n", b"hello, world\n");
        handler.send_all(&windows).unwrap();
        readme.close(Some(md5_hex(b"hello, world\n").as_str())).unwrap();
        root.delete_entry("empty", Some(1)).unwrap();
        root.close().unwrap();
        editor.close().unwrap();
    }
    assert_eq!(committed, Some(2));

    let admin = MemWcAdmin::checkout(repo.root_url(), "trunk", 1, &checkout);
    let mut consumer = TreeEditor::new(checkout);
    {
        let mut reporter = session
            .do_update(&UpdateOptions::new("", Depth::Infinity), &mut consumer)
            .unwrap();
        crawl_revisions(&admin, &mut reporter).unwrap();
    }
    let updated = consumer.into_tree();
    assert_eq!(updated, repo.tree_at(2).unwrap().subtree("trunk").unwrap());
    assert_eq!(updated.file("README").unwrap().contents, b"hello, world\n");
    assert!(updated.get("empty").is_none());
}

#[test]
fn commit_queue_is_one_shot() {
    let admin = Rc::new(RefCell::new(MemWcAdmin::checkout("mem://r", "", 1, &sample_tree())));
    let ctx: WcContext = admin.clone();
    let mut queue = CommitQueue::new();
    queue.queue("trunk", &ctx, QueueItemOptions::new().recurse()).unwrap();
    queue.queue("tags", &ctx, QueueItemOptions::new()).unwrap();

    let date = "2024-05-01T12:00:00.000000Z";
    let outcome = queue.process(2, date, "alice").unwrap();
    assert!(outcome.is_complete());
    assert_protocol(queue.process(3, date, "bob"));

    let wc = admin.borrow();
    let readme = wc.entry("trunk/README").unwrap().unwrap();
    assert_eq!(readme.revision, 2);
    assert_eq!(readme.cmt_author.as_deref(), Some("alice"));
    assert_eq!(wc.entry("").unwrap().unwrap().revision, 1);
}

proptest! {
    #[test]
    fn generated_deltas_rebuild_the_target(
        source in proptest::collection::vec(any::<u8>(), 0..4096),
        target in proptest::collection::vec(any::<u8>(), 0..4096),
        window_size in 64usize..2048,
    ) {
        let windows = DeltaGenerator::new(window_size).delta_windows(&source, &target);
        let mut applier = TextDeltaApplier::new("f", source.clone());
        for window in &windows {
            applier.apply(window).unwrap();
        }
        let (text, checksum) = applier.finish();
        prop_assert_eq!(checksum, md5_hex(&target));
        prop_assert_eq!(text, target);
    }
}
