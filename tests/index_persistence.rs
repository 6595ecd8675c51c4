//! Index persistence across restarts: enroll a population, save, reload,
//! and verify the mapping and query behavior survive byte-for-byte.

use std::path::Path;

use visage_db::config::IndexParams;
use visage_db::index::{FaceIndex, IndexUserMeta};

const DIM: usize = 128;
const POPULATION: u64 = 1000;

fn descriptor(seed: u64) -> Vec<f32> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let raw: Vec<f32> = (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect();
    visage_core::l2_normalized(&raw)
}

fn open_index(dir: &Path) -> FaceIndex {
    let mut index = FaceIndex::new(
        IndexParams {
            dim: DIM,
            m: 16,
            ef_construction: 100,
            ef_search: 100,
            max_elements: 10_000,
        },
        1_000_000, // no mid-test async persist hints
        dir.join("faces.idx"),
        dir.join("faces.meta.json"),
    );
    index.init().expect("index init");
    index
}

#[test]
fn thousand_users_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let probes: Vec<u64> = vec![1, 137, 500, 999];
    let mut expected_top1: Vec<(u64, u64)> = Vec::new();

    {
        let mut index = open_index(dir.path());
        for user_id in 1..=POPULATION {
            index
                .add_user(
                    user_id,
                    descriptor(user_id),
                    IndexUserMeta {
                        user_id,
                        external_id: format!("ext-{}", user_id),
                        display_name: format!("User {}", user_id),
                        client_ref: "bulk".to_string(),
                    },
                )
                .expect("add user");
        }
        assert_eq!(index.size(), POPULATION);

        for &probe in &probes {
            let hits = index
                .search(&descriptor(probe), 1, f32::INFINITY)
                .expect("probe search");
            expected_top1.push((probe, hits[0].user_id));
        }

        index.save().expect("save index");
    }

    let index = open_index(dir.path());
    assert_eq!(index.size(), POPULATION);
    assert_eq!(index.stats().physical_vectors, POPULATION);

    for (probe, expected) in expected_top1 {
        let hits = index
            .search(&descriptor(probe), 1, f32::INFINITY)
            .expect("probe search after reload");
        assert_eq!(
            hits[0].user_id, expected,
            "probe {} should still resolve to user {}",
            probe, expected
        );
        assert_eq!(hits[0].external_id, format!("ext-{}", expected));
        assert!(hits[0].distance < 1e-3);
    }
}

#[test]
fn masked_and_updated_labels_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut index = open_index(dir.path());
        for user_id in 1..=50u64 {
            index
                .add_user(
                    user_id,
                    descriptor(user_id),
                    IndexUserMeta {
                        user_id,
                        external_id: format!("ext-{}", user_id),
                        display_name: format!("User {}", user_id),
                        client_ref: "bulk".to_string(),
                    },
                )
                .expect("add user");
        }
        index.remove_user(13);
        index
            .update_user(
                21,
                descriptor(2100),
                IndexUserMeta {
                    user_id: 21,
                    external_id: "ext-21".to_string(),
                    display_name: "User 21".to_string(),
                    client_ref: "bulk".to_string(),
                },
            )
            .expect("update user");
        index.save().expect("save");
    }

    let index = open_index(dir.path());
    assert_eq!(index.size(), 49);

    let hits = index
        .search(&descriptor(13), 10, f32::INFINITY)
        .expect("search removed");
    assert!(hits.iter().all(|h| h.user_id != 13));

    let hits = index
        .search(&descriptor(2100), 1, f32::INFINITY)
        .expect("search updated");
    assert_eq!(hits[0].user_id, 21);
}
