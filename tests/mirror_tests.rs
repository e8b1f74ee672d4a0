//! Integration tests for client mirrors against a live server
//!
//! Every test drives real requests through [`Server::handle`] and feeds the
//! resulting messages into [`MirrorCache`]s, then compares client and server
//! state.

mod common;

use common::{counter_host, TestClient};
use pretty_assertions::assert_eq;
use scopesync::client::MirrorCache;
use scopesync::identity::ObjectId;
use scopesync::protocol::{ClientMessage, EventType, Handshake, Notify, Query};
use scopesync::{Server, ServerConfig, Value};
use serde_json::json;

/// A test client with its own mirror
struct Peer {
    client: TestClient,
    mirror: MirrorCache,
}

impl Peer {
    fn join(server: &Server, session: &str) -> (Self, ObjectId) {
        let client = TestClient::new();
        let mut mirror = MirrorCache::new();
        server
            .handle(&client.link, ClientMessage::Handshake(Handshake::view(1, session, "home", 1)))
            .unwrap();
        let mut target = None;
        for message in client.memory.take() {
            if let scopesync::protocol::ServerMessage::HandshakeInform { target: bound, .. } = &message {
                target = Some(*bound);
            }
            mirror.apply(&message).unwrap();
        }
        (Self { client, mirror }, target.unwrap())
    }

    fn sync(&mut self) {
        for message in self.client.memory.take() {
            self.mirror.apply(&message).unwrap();
        }
    }

    fn send(&self, server: &Server, message: ClientMessage) {
        server.handle(&self.client.link, message).unwrap();
    }
}

/// Counter app plus `seed`, which stores `[10, 20, 30]` under `list`, and
/// `share`, which stores one array under both `a` and `b`
fn server() -> Server {
    let host = counter_host()
        .method("seed", |ctx, this, _args| {
            let list = Value::new_array(vec![10.0.into(), 20.0.into(), 30.0.into()]);
            ctx.set(this, "list", list)?;
            Ok(Value::Undefined)
        })
        .method("share", |ctx, this, _args| {
            let shared = Value::new_array(vec!["x".into()]);
            ctx.set(this, "a", shared.clone())?;
            ctx.set(this, "b", shared)?;
            Ok(Value::Undefined)
        });
    let server = Server::new(ServerConfig::default());
    server.register_application(1, "mirror", host.into_host());
    server
}

fn server_list(server: &Server, session: &str) -> (ObjectId, serde_json::Value) {
    let page = server.session(1, session).unwrap().child("home").unwrap();
    let list = page.get("list");
    let list = list.as_object().unwrap();
    (list.id(), Value::Object(list.clone()).to_plain_json())
}

/// Seed the list, then have `editor` delete `index` locally and notify the server
fn delete_and_compare(index: &str, expected: serde_json::Value) {
    let server = server();
    let (mut editor, target) = Peer::join(&server, "s1");
    let (mut watcher, _) = Peer::join(&server, "s1");

    editor.send(&server, ClientMessage::Query(Query::new("s1", 2, target, "seed")));
    editor.sync();
    watcher.sync();
    let (list_id, _) = server_list(&server, "s1");
    assert_eq!(watcher.mirror.get(list_id), Some(&json!([10, 20, 30])));

    editor.mirror.delete_member(list_id, index).unwrap();
    editor.send(
        &server,
        ClientMessage::Notify(Notify::new(list_id, EventType::PropertyDelete, index, None)),
    );
    editor.sync();
    watcher.sync();

    let (_, on_server) = server_list(&server, "s1");
    assert_eq!(on_server, expected);
    assert_eq!(editor.mirror.get(list_id), Some(&expected));
    assert_eq!(watcher.mirror.get(list_id), Some(&expected));
}

mod array_parity {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_delete_first_index_shifts() {
        delete_and_compare("0", json!([20, 30]));
    }

    #[test]
    fn test_delete_last_index_pops() {
        delete_and_compare("2", json!([10, 20]));
    }

    #[test]
    fn test_delete_middle_index_compacts() {
        delete_and_compare("1", json!([10, 30]));
    }

    /// Seed the list on the server and both mirrors; return the peers and the list id
    fn seeded() -> (Server, Peer, Peer, ObjectId) {
        let server = server();
        let (mut editor, target) = Peer::join(&server, "s1");
        let (mut watcher, _) = Peer::join(&server, "s1");
        editor.send(&server, ClientMessage::Query(Query::new("s1", 2, target, "seed")));
        editor.sync();
        watcher.sync();
        let (list_id, _) = server_list(&server, "s1");
        (server, editor, watcher, list_id)
    }

    #[test]
    fn test_put_past_the_end_pads_everywhere() {
        let (server, mut editor, mut watcher, list_id) = seeded();

        editor.mirror.put_member(list_id, "4", &json!(50)).unwrap();
        let put = Notify::new(list_id, EventType::PropertyPut, "4", Some(&json!(50)));
        editor.send(&server, ClientMessage::Notify(put));
        editor.sync();
        watcher.sync();

        let expected = json!([10, 20, 30, null, 50]);
        assert_eq!(server_list(&server, "s1").1, expected);
        assert_eq!(editor.mirror.get(list_id), Some(&expected));
        assert_eq!(watcher.mirror.get(list_id), Some(&expected));
    }

    #[test]
    fn test_far_index_is_refused_everywhere() {
        let (server, mut editor, mut watcher, list_id) = seeded();
        let index = usize::MAX.to_string();

        assert!(editor.mirror.set_member(list_id, &index, &json!(1)).is_err());
        let set = Notify::new(list_id, EventType::PropertySet, &index, Some(&json!(1)));
        editor.send(&server, ClientMessage::Notify(set));
        editor.sync();
        watcher.sync();

        let expected = json!([10, 20, 30]);
        assert_eq!(server_list(&server, "s1").1, expected);
        assert_eq!(editor.mirror.get(list_id), Some(&expected));
        assert_eq!(watcher.mirror.get(list_id), Some(&expected));
    }
}

mod convergence {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mirrors_follow_increments() {
        let server = server();
        let (mut a, target) = Peer::join(&server, "s1");
        let (mut b, _) = Peer::join(&server, "s1");

        for callback in 0..3 {
            a.send(&server, ClientMessage::Query(Query::new("s1", callback, target, "increment")));
            b.send(&server, ClientMessage::Query(Query::new("s1", callback, target, "increment")));
        }
        a.sync();
        b.sync();

        let page = server.session(1, "s1").unwrap().child("home").unwrap();
        let expected = Value::Object(page.object().clone()).to_plain_json();
        assert_eq!(expected, json!({"count": 6}));
        assert_eq!(a.mirror.materialize(target), Some(expected.clone()));
        assert_eq!(b.mirror.materialize(target), Some(expected));
    }

    #[test]
    fn test_local_edits_reach_other_mirrors() {
        let server = server();
        let (mut a, target) = Peer::join(&server, "s1");
        let (mut b, _) = Peer::join(&server, "s1");

        if let Some(serde_json::Value::Object(state)) = a.mirror.live_mut(target) {
            state.insert("title".into(), json!("groceries"));
            state.insert("count".into(), json!(4));
        }
        let edits = a.mirror.diff(target);
        assert_eq!(edits.len(), 2);
        a.mirror.acknowledge(target);
        for notify in edits {
            a.send(&server, ClientMessage::Notify(notify));
        }
        assert_eq!(a.client.memory.message_count(), 0);
        b.sync();

        assert!(a.mirror.diff(target).is_empty());
        let page = server.session(1, "s1").unwrap().child("home").unwrap();
        assert_eq!(page.get("title"), Value::from("groceries"));
        assert_eq!(b.mirror.materialize(target), a.mirror.materialize(target));
    }

    #[test]
    fn test_shared_objects_arrive_as_references() {
        let server = server();
        let (a, target) = Peer::join(&server, "s1");
        a.send(&server, ClientMessage::Query(Query::new("s1", 1, target, "share")));

        let (late, _) = Peer::join(&server, "s1");
        let page = late.mirror.get(target).unwrap();
        assert_eq!(page["a"], page["b"]);
        assert_eq!(
            late.mirror.materialize(target),
            Some(json!({"count": 0, "a": ["x"], "b": ["x"]}))
        );
    }

    #[test]
    fn test_scope_attachment_is_visible_to_session_mirror() {
        let server = server();
        let (mut a, _) = Peer::join(&server, "s1");
        let session = server.session(1, "s1").unwrap();
        a.mirror.scan(&Value::Object(session.object().clone()).to_json());

        let handshake = Handshake::view(1, "s1", "settings", 2);
        let other = TestClient::new();
        server.handle(&other.link, ClientMessage::Handshake(handshake)).unwrap();
        a.sync();

        let state = a.mirror.materialize(session.id()).unwrap();
        assert_eq!(state["settings"], json!({"count": 0}));
        assert_eq!(state["home"], json!({"count": 0}));
    }
}
