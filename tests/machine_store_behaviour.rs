//! Behavioural tests for the machine record store.

use camino::Utf8PathBuf;
use tempfile::TempDir;

use corral::connectivity::ConnectivityKind;
use corral::machine::store::{MachineStore, MachineStoreError};
use corral::machine::{Machine, OllamaEndpoint};
use corral::provider::{MachineState, ProviderMachine};
use corral::ssh::KeyPairFiles;

fn scratch_store() -> (TempDir, MachineStore) {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("{err}"));
    let path = Utf8PathBuf::from_path_buf(dir.path().join("machines"))
        .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
    let store = MachineStore::open(&path).unwrap_or_else(|err| panic!("{err}"));
    (dir, store)
}

fn sample_machine(id: &str, name: &str) -> Machine {
    Machine {
        instance: ProviderMachine {
            id: id.to_owned(),
            name: name.to_owned(),
            ip: Some(String::from("127.0.0.1")),
            region: String::from("fr-par-1"),
            state: MachineState::Running,
        },
        ollama: OllamaEndpoint {
            host: String::from("localhost"),
            port: 11434,
        },
        provider_name: String::from("scaleway"),
        credentials_name: String::from("acct1"),
        connectivity: ConnectivityKind::Private,
        key_pair: Some(KeyPairFiles {
            private_key_path: Utf8PathBuf::from("/tmp/keys/demo"),
            public_key_path: Utf8PathBuf::from("/tmp/keys/demo.pub"),
        }),
    }
}

#[test]
fn round_trip_by_id_and_name_yields_identical_records() {
    let (_guard, store) = scratch_store();
    let machine = sample_machine("test-id", "test-name");
    store.save(&machine).unwrap_or_else(|err| panic!("{err}"));

    let by_id = store.get("test-id").unwrap_or_else(|err| panic!("{err}"));
    let by_name = store
        .get_by_name("test-name")
        .unwrap_or_else(|err| panic!("{err}"));

    assert_eq!(by_id, machine);
    assert_eq!(by_name, machine);

    // The two fetches decode the exact same bytes.
    let id_bytes = serde_json::to_vec(&by_id).unwrap_or_else(|err| panic!("{err}"));
    let name_bytes = serde_json::to_vec(&by_name).unwrap_or_else(|err| panic!("{err}"));
    assert_eq!(id_bytes, name_bytes);
}

#[test]
fn list_on_empty_store_returns_empty_sequence() {
    let (_guard, store) = scratch_store();
    let machines = store.list().unwrap_or_else(|err| panic!("{err}"));
    assert!(machines.is_empty());
}

#[test]
fn list_skips_files_that_are_not_records() {
    let (guard, store) = scratch_store();
    store
        .save(&sample_machine("m-1", "alpha"))
        .unwrap_or_else(|err| panic!("{err}"));
    std::fs::write(guard.path().join("machines/junk.txt"), b"not a record")
        .unwrap_or_else(|err| panic!("{err}"));

    let machines = store.list().unwrap_or_else(|err| panic!("{err}"));
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].instance.name, "alpha");
}

#[test]
fn save_overwrites_by_id() {
    let (_guard, store) = scratch_store();
    let mut machine = sample_machine("m-1", "alpha");
    store.save(&machine).unwrap_or_else(|err| panic!("{err}"));

    machine.instance.state = MachineState::Stopped;
    store.save(&machine).unwrap_or_else(|err| panic!("{err}"));

    let reloaded = store.get("m-1").unwrap_or_else(|err| panic!("{err}"));
    assert_eq!(reloaded.instance.state, MachineState::Stopped);
    assert_eq!(store.list().unwrap_or_else(|err| panic!("{err}")).len(), 1);
}

#[test]
fn get_and_delete_of_unknown_ids_error() {
    let (_guard, store) = scratch_store();

    let missing = store.get("ghost");
    assert!(matches!(
        missing,
        Err(MachineStoreError::NotFoundById { ref id }) if id == "ghost"
    ));

    let missing_name = store.get_by_name("ghost");
    assert!(matches!(
        missing_name,
        Err(MachineStoreError::NotFoundByName { ref name }) if name == "ghost"
    ));

    let deleted = store.delete("ghost");
    assert!(matches!(
        deleted,
        Err(MachineStoreError::NotFoundById { .. })
    ));
}

#[test]
fn delete_removes_the_record() {
    let (_guard, store) = scratch_store();
    store
        .save(&sample_machine("m-1", "alpha"))
        .unwrap_or_else(|err| panic!("{err}"));

    store.delete("m-1").unwrap_or_else(|err| panic!("{err}"));
    assert!(store.list().unwrap_or_else(|err| panic!("{err}")).is_empty());
}

#[test]
fn list_sorts_machines_by_name() {
    let (_guard, store) = scratch_store();
    store
        .save(&sample_machine("m-2", "bravo"))
        .unwrap_or_else(|err| panic!("{err}"));
    store
        .save(&sample_machine("m-1", "alpha"))
        .unwrap_or_else(|err| panic!("{err}"));

    let names: Vec<String> = store
        .list()
        .unwrap_or_else(|err| panic!("{err}"))
        .into_iter()
        .map(|machine| machine.instance.name)
        .collect();
    assert_eq!(names, ["alpha", "bravo"]);
}
