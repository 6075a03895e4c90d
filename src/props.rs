use crate::address::{AuthorKeypair, ShareAddress};
use crate::base32;
use crate::crypto::{CryptoProvider, DalekCrypto};
use crate::format::{DocInput, EsFive, Format};
use crate::path::Path;
use crate::replica::{IngestOutcome, Replica, SetInput};
use crate::util::now_microseconds;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

fn arb_author() -> impl Strategy<Value = AuthorKeypair> {
    ("[a-z][a-z0-9]{3}", any::<[u8; 32]>())
        .prop_map(|(shortname, secret)| AuthorKeypair::from_secret(&shortname, &secret).unwrap())
}

fn arb_share() -> impl Strategy<Value = ShareAddress> {
    any::<[u8; 32]>().prop_map(|secret| {
        let keypair = DalekCrypto.keypair_from_secret(&secret).unwrap();
        ShareAddress::from_parts("proptesting", &keypair.public).unwrap()
    })
}

fn arb_path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9]{1,8}", 1..4).prop_map(|segments| {
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(&segment);
        }
        path
    })
}

fn arb_text() -> impl Strategy<Value = String> {
    ".{0,32}"
}

proptest! {
    #[test]
    fn generated_docs_are_valid_and_verifiable(
        author in arb_author(),
        share in arb_share(),
        path in arb_path(),
        text in arb_text(),
    ) {
        let now = now_microseconds();
        let doc = EsFive
            .generate_document(
                &author,
                &share,
                DocInput { path, text, ..Default::default() },
                now,
            )
            .unwrap();
        prop_assert!(EsFive.check_document_is_valid(&doc, now).is_ok());

        let hash = EsFive.hash_document(&doc).unwrap();
        let signature: [u8; 64] = base32::decode(&doc.signature).unwrap().try_into().unwrap();
        prop_assert!(DalekCrypto.verify(
            &doc.author.public_key(),
            &signature,
            hash.as_bytes(),
        ));
    }

    #[test]
    fn hashing_ignores_the_signature(
        author in arb_author(),
        share in arb_share(),
        path in arb_path(),
        text in arb_text(),
    ) {
        let now = now_microseconds();
        let doc = EsFive
            .generate_document(
                &author,
                &share,
                DocInput { path, text, ..Default::default() },
                now,
            )
            .unwrap();
        let mut unsigned = doc.clone();
        unsigned.signature = String::new();
        prop_assert_eq!(
            EsFive.hash_document(&unsigned).unwrap(),
            EsFive.hash_document(&doc).unwrap()
        );
    }

    #[test]
    fn one_row_per_path_and_author(
        author in arb_author(),
        text_one in arb_text(),
        text_two in arb_text(),
        path in arb_path(),
        newer_first in any::<bool>(),
    ) {
        let share = arb_share_value(&author);
        let mut replica = Replica::memory(share.clone()).unwrap();
        let now = now_microseconds();
        let make = |text: String, offset: u64| {
            EsFive
                .generate_document(
                    &author,
                    &share,
                    DocInput {
                        path: path.clone(),
                        text,
                        timestamp: Some(now + offset),
                        ..Default::default()
                    },
                    now,
                )
                .unwrap()
        };
        let older = make(text_one, 0);
        let newer = make(text_two.clone(), 1);
        let pair = if newer_first { [newer, older] } else { [older, newer] };
        let mut stored = 0;
        for doc in pair {
            match replica.ingest(&EsFive, doc, "prop") {
                Ok(IngestOutcome::Ingested { .. }) => stored += 1,
                Ok(IngestOutcome::Obsolete) => {}
                Err(err) => return Err(TestCaseError::fail(err.to_string())),
            }
        }
        prop_assert!(stored >= 1);

        // Whatever the arrival order, exactly one row survives and it is
        // the newer document.
        let history = replica.all_docs_at_path(&Path::parse(&path).unwrap()).unwrap();
        prop_assert_eq!(history.len(), 1);
        prop_assert_eq!(history[0].timestamp, now + 1);
        prop_assert_eq!(&history[0].text, &text_two);
    }

    #[test]
    fn local_indexes_strictly_increase(
        author in arb_author(),
        paths in prop::collection::vec(arb_path(), 1..6),
    ) {
        let share = arb_share_value(&author);
        let mut replica = Replica::memory(share).unwrap();
        let mut last: i64 = -1;
        for path in paths {
            let outcome = replica
                .set(
                    &author,
                    SetInput { path, text: "x".into(), ..Default::default() },
                )
                .unwrap();
            let doc = match outcome {
                IngestOutcome::Ingested { doc, .. } => doc,
                IngestOutcome::Obsolete => {
                    return Err(TestCaseError::fail("set should always win its path"))
                }
            };
            let index = doc.local_index.unwrap() as i64;
            prop_assert!(index > last);
            last = index;
        }
    }

    #[test]
    fn wipe_roundtrip(
        author in arb_author(),
        path in arb_path(),
        text in ".{1,32}",
    ) {
        let share = arb_share_value(&author);
        let mut replica = Replica::memory(share).unwrap();
        replica
            .set(
                &author,
                SetInput { path: path.clone(), text, ..Default::default() },
            )
            .unwrap();
        let path = Path::parse(&path).unwrap();
        let wiped = replica.wipe_doc_at_path(&author, &path).unwrap();
        prop_assert_eq!(&wiped.text, "");
        let latest = replica.latest_doc_at_path(&path).unwrap().unwrap();
        prop_assert_eq!(&latest.text, "");
        prop_assert_eq!(&latest.signature, &wiped.signature);
    }
}

/// A share derived from the author's key material, so every generated case
/// is fully determined by its strategy inputs.
fn arb_share_value(author: &AuthorKeypair) -> ShareAddress {
    ShareAddress::from_parts("proptesting", &author.keypair().public).unwrap()
}
