mod common;

use common::{open_client, person, user, wait_for, Person, Recorder, User, WAIT};
use ctrlkit::model::{Catalog, ListOptions};
use ctrlkit::{Action, Client, ClientConfig, Error, Event, EventHandler};

#[test]
fn fresh_watch_reads_back_persons_and_users() {
    let (_dir, client) = open_client("roundtrip.db");
    let people = [person(1, "ada", "core"), person(2, "bob", "edge")];
    let users = [user("carol", Some("carol@example.com"), true), user("dave", None, false)];
    for p in &people {
        client.insert(p).unwrap();
    }
    for u in &users {
        client.insert(u).unwrap();
    }

    let person_rec = Recorder::<Person>::default();
    let user_rec = Recorder::<User>::default();
    let w1 = client.watch::<Person, _>(person_rec.clone()).unwrap();
    let w2 = client.watch::<User, _>(user_rec.clone()).unwrap();
    wait_for(WAIT, || person_rec.len() == 2 && user_rec.len() == 2);

    let seen_people: Vec<Person> = person_rec.events().into_iter().map(|e| e.model).collect();
    let seen_users: Vec<User> = user_rec.events().into_iter().map(|e| e.model).collect();
    assert_eq!(seen_people, people.to_vec());
    assert_eq!(seen_users, users.to_vec());
    for e in person_rec.events() {
        assert_eq!(e.action, Action::Created);
        assert_eq!(e.id, 0);
        assert_eq!(e.updated, None);
    }

    w1.end();
    w2.end();
    w1.join().unwrap();
    w2.join().unwrap();
    assert!(person_rec.is_ended());
    assert!(user_rec.is_ended());
}

#[test]
fn delayed_start_replays_history_in_order() {
    let (_dir, client) = open_client("delayed.db");
    let rec = Recorder::<Person>::default();
    let mut watch = client.journal().watch::<Person, _>(rec.clone()).unwrap();

    let ada = person(1, "ada", "core");
    let older = Person { age: 99, ..ada.clone() };
    client.insert(&ada).unwrap();
    client.insert(&user("eve", None, false)).unwrap();
    client.update(&older).unwrap();
    client.delete(&older).unwrap();

    // Nothing is delivered before start.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(rec.len(), 0);

    watch.start(Vec::new()).unwrap();
    wait_for(WAIT, || rec.len() == 3);

    let events = rec.events();
    let actions: Vec<Action> = events.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![Action::Created, Action::Updated, Action::Deleted]);
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(events[1].model, ada);
    assert_eq!(events[1].updated.as_ref(), Some(&older));
    assert_eq!(events[2].model, older);

    watch.end();
    watch.join().unwrap();
    assert!(rec.errors().is_empty());
}

#[test]
fn snapshot_precedes_live_events() {
    let (_dir, client) = open_client("snapshot.db");
    for id in 1..=3 {
        client.insert(&person(id, "p", "core")).unwrap();
    }
    let rec = Recorder::<Person>::default();
    let watch = client.watch::<Person, _>(rec.clone()).unwrap();
    client.insert(&person(4, "live", "core")).unwrap();
    wait_for(WAIT, || rec.len() == 4);

    let events = rec.events();
    assert!(events[..3].iter().all(|e| e.id == 0 && e.action == Action::Created));
    assert!(events[3].id > 0);
    assert_eq!(events[3].model.name, "live");
    watch.end();
    watch.join().unwrap();
}

#[test]
fn ended_watch_stops_delivery_and_end_is_idempotent() {
    let (_dir, client) = open_client("end.db");
    let rec = Recorder::<Person>::default();
    let watch = client.watch::<Person, _>(rec.clone()).unwrap();
    assert_eq!(client.journal().watch_count(), 1);

    watch.end();
    watch.end();
    assert!(watch.is_ended());
    assert!(!client.journal().end(watch.id()));
    client.insert(&person(1, "late", "core")).unwrap();
    watch.join().unwrap();

    assert!(rec.is_ended());
    assert_eq!(rec.len(), 0);
    assert_eq!(client.journal().watch_count(), 0);
}

#[test]
fn no_history_without_watches() {
    let (_dir, client) = open_client("quiet.db");
    client.insert(&person(1, "a", "core")).unwrap();
    assert_eq!(client.journal().event_id(), 0);
    assert_eq!(client.count::<ctrlkit::model::EventHistory>(None).unwrap(), 0);
}

#[test]
fn failed_mutation_leaves_no_history() {
    let (_dir, client) = open_client("failed.db");
    let rec = Recorder::<Person>::default();
    let watch = client.watch::<Person, _>(rec.clone()).unwrap();

    client.insert(&person(1, "a", "core")).unwrap();
    assert!(client.insert(&person(1, "dup", "core")).is_err());
    assert!(client.update(&person(2, "ghost", "core")).unwrap_err().is_not_found());
    assert!(client.delete(&person(2, "ghost", "core")).unwrap_err().is_not_found());
    client.insert(&person(3, "c", "core")).unwrap();

    wait_for(WAIT, || rec.len() == 2);
    let ids: Vec<i64> = rec.events().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(client.count::<ctrlkit::model::EventHistory>(None).unwrap(), 2);
    watch.end();
    watch.join().unwrap();
}

#[test]
fn reopen_resumes_event_ids() {
    let (_dir, client) = open_client("reopen.db");
    let first = Recorder::<Person>::default();
    let w = client.watch::<Person, _>(first.clone()).unwrap();
    client.insert(&person(1, "a", "core")).unwrap();
    client.insert(&person(2, "b", "core")).unwrap();
    wait_for(WAIT, || first.len() == 2);
    client.close(false).unwrap();
    w.join().unwrap();
    assert!(first.is_ended());

    let reopened = Client::new(ClientConfig::new(client.config().path.clone()), common::catalog());
    reopened.open(false).unwrap();
    assert_eq!(reopened.journal().event_id(), 2);

    let second = Recorder::<Person>::default();
    let w = reopened.watch::<Person, _>(second.clone()).unwrap();
    reopened.insert(&person(3, "c", "core")).unwrap();
    wait_for(WAIT, || second.len() == 3);
    let last = second.events().pop().unwrap();
    assert_eq!(last.id, 3);
    assert_eq!(last.model.name, "c");
    w.end();
    w.join().unwrap();
}

#[test]
fn watch_on_closed_client_fails() {
    let (_dir, path) = common::create_temp_db("closed.db");
    let client = Client::new(ClientConfig::new(path), Catalog::new());
    let err = client.journal().watch::<ctrlkit::model::Label, _>(Recorder::default()).unwrap_err();
    assert!(matches!(err, ctrlkit::Error::Closed(_)));
    assert!(client.list::<ctrlkit::model::Label>(&ListOptions::default()).is_err());
}

#[test]
fn undecodable_history_is_reported_and_delivery_continues() {
    let (_dir, path) = common::create_temp_db("corrupt.db");
    let client = Client::new(ClientConfig::new(&path).with_page_limit(1), common::catalog());
    client.open(true).unwrap();
    let rec = Recorder::<Person>::default();
    let mut watch = client.journal().watch::<Person, _>(rec.clone()).unwrap();
    for id in 1..=3 {
        client.insert(&person(id, "p", "core")).unwrap();
    }

    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute("UPDATE \"EventHistory\" SET \"model\" = '{bad' WHERE \"id\" = 2", [])
        .unwrap();
    drop(other);

    watch.start(Vec::new()).unwrap();
    wait_for(WAIT, || rec.len() == 2);
    client.insert(&person(4, "live", "core")).unwrap();
    wait_for(WAIT, || rec.len() == 3);

    let ids: Vec<i64> = rec.events().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 3, 4]);
    let errors = rec.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("decode history 2 of Person"), "{}", errors[0]);

    watch.end();
    watch.join().unwrap();
    assert!(rec.is_ended());
}

#[test]
fn ended_before_start_never_delivers() {
    let (_dir, client) = open_client("ended_unstarted.db");
    let rec = Recorder::<Person>::default();
    let mut watch = client.journal().watch::<Person, _>(rec.clone()).unwrap();
    watch.end();
    assert!(rec.is_ended());
    assert!(matches!(watch.start(vec![person(9, "ghost", "core")]), Err(Error::Closed(_))));
    assert!(!watch.is_started());

    // Ended through the journal instead of the handle.
    let other = Recorder::<Person>::default();
    let mut second = client.journal().watch::<Person, _>(other.clone()).unwrap();
    assert!(client.journal().end(second.id()));
    assert!(matches!(second.start(vec![person(9, "ghost", "core")]), Err(Error::Closed(_))));
    assert!(other.is_ended());

    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(rec.len(), 0);
    assert_eq!(other.len(), 0);
    watch.join().unwrap();
    second.join().unwrap();
}

struct Explode;

impl EventHandler<Person> for Explode {
    fn created(&mut self, event: Event<Person>) {
        panic!("cannot handle {}", event.model.name);
    }

    fn updated(&mut self, _: Event<Person>) {}

    fn deleted(&mut self, _: Event<Person>) {}
}

#[test]
fn handler_panic_is_reported_by_join() {
    let (_dir, client) = open_client("panic.db");
    client.insert(&person(1, "ada", "core")).unwrap();
    let watch = client.watch::<Person, _>(Explode).unwrap();
    watch.end();
    match watch.join() {
        Err(Error::Panicked(message)) => assert!(message.contains("cannot handle ada"), "{message}"),
        other => panic!("expected a panic report, got {other:?}"),
    }
}
