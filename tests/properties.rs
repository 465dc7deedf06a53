//! Property tests for the pure layers: addresses, hashing, ordering.

use earthstar::address::{check_author_can_write_to_path, check_path_is_valid};
use earthstar::crypto::RustCrypto;
use earthstar::format::{Format, GenerateDocumentArgs, ES5};
use earthstar::query::{doc_matches_filter, QueryFilter};
use earthstar::{cmp_newest_first, AuthorKeypair, ShareKeypair, MIN_TIMESTAMP};
use proptest::prelude::*;

fn valid_path() -> impl Strategy<Value = String> {
    // slash-led segments from the path alphabet, no '!', no '~', no '*'
    proptest::collection::vec("[a-z0-9._'()-]{1,12}", 1..4)
        .prop_map(|segments| format!("/{}", segments.join("/")))
}

proptest! {
    #[test]
    fn path_validator_never_accepts_malformed_paths(s in ".{0,64}") {
        // must not panic, and anything accepted satisfies the shape rules
        if check_path_is_valid(&s, false).is_ok() {
            prop_assert!(s.starts_with('/'));
            prop_assert!(!s.ends_with('/'));
            prop_assert!(!s.contains("//"));
            prop_assert!(!s.starts_with("/@"));
            prop_assert!(!s.contains('!'));
            prop_assert!(s.len() >= 2 && s.len() <= 512);
        }
    }

    #[test]
    fn ephemeral_marker_couples_to_delete_after(path in valid_path()) {
        // a permanent path is rejected as soon as a deleteAfter appears
        prop_assert!(check_path_is_valid(&path, false).is_ok());
        prop_assert!(check_path_is_valid(&path, true).is_err());
        let ephemeral = format!("{path}!");
        prop_assert!(check_path_is_valid(&ephemeral, true).is_ok());
        prop_assert!(check_path_is_valid(&ephemeral, false).is_err());
    }

    #[test]
    fn generated_docs_validate_and_hash_idempotently(
        path in valid_path(),
        text in ".{0,200}",
        offset in 0u64..1_000_000,
    ) {
        let crypto = RustCrypto;
        let keypair = AuthorKeypair::generate(&crypto, "prop").unwrap();
        let share = ShareKeypair::generate(&crypto, "proptest").unwrap().address;
        let timestamp = earthstar::now_microseconds() - offset;

        let doc = ES5
            .generate_document(
                &crypto,
                GenerateDocumentArgs {
                    keypair: &keypair,
                    share: &share,
                    path,
                    text,
                    timestamp,
                    delete_after: None,
                },
            )
            .unwrap();

        // every generated document passes the full validity check
        prop_assert!(ES5
            .check_document_is_valid(&crypto, &doc, earthstar::now_microseconds())
            .is_ok());

        // hashing ignores the signature: unsigned and signed hashes agree
        let mut unsigned = doc.clone();
        unsigned.signature = String::new();
        prop_assert_eq!(
            ES5.hash_document(&crypto, &doc).unwrap(),
            ES5.hash_document(&crypto, &unsigned).unwrap()
        );

        // signing is deterministic
        let re_signed = ES5
            .sign_document(&crypto, &keypair, unsigned)
            .unwrap();
        prop_assert_eq!(re_signed.signature, doc.signature);
    }

    #[test]
    fn content_length_filter_counts_utf8_bytes(text in "\\PC{0,50}") {
        let crypto = RustCrypto;
        let keypair = AuthorKeypair::generate(&crypto, "prop").unwrap();
        let share = ShareKeypair::generate(&crypto, "proptest").unwrap().address;
        let doc = ES5
            .generate_document(
                &crypto,
                GenerateDocumentArgs {
                    keypair: &keypair,
                    share: &share,
                    path: "/p".to_string(),
                    text: text.clone(),
                    timestamp: earthstar::now_microseconds(),
                    delete_after: None,
                },
            )
            .unwrap();
        let filter = QueryFilter {
            content_length: Some(text.len() as u64),
            ..Default::default()
        };
        prop_assert!(doc_matches_filter(&doc, &filter));
    }

    #[test]
    fn glob_without_stars_is_exact_match(a in valid_path(), b in valid_path()) {
        let crypto = RustCrypto;
        let keypair = AuthorKeypair::generate(&crypto, "prop").unwrap();
        let share = ShareKeypair::generate(&crypto, "proptest").unwrap().address;
        let doc = ES5
            .generate_document(
                &crypto,
                GenerateDocumentArgs {
                    keypair: &keypair,
                    share: &share,
                    path: a.clone(),
                    text: String::new(),
                    timestamp: earthstar::now_microseconds(),
                    delete_after: None,
                },
            )
            .unwrap();
        let filter = QueryFilter {
            path_glob: Some(b.clone()),
            ..Default::default()
        };
        prop_assert_eq!(doc_matches_filter(&doc, &filter), a == b);
    }

    #[test]
    fn history_ordering_is_total(
        ts in proptest::collection::vec(MIN_TIMESTAMP..MIN_TIMESTAMP + 1000, 2..8),
    ) {
        let crypto = RustCrypto;
        let keypair = AuthorKeypair::generate(&crypto, "prop").unwrap();
        let share = ShareKeypair::generate(&crypto, "proptest").unwrap().address;
        let mut docs: Vec<_> = ts
            .into_iter()
            .map(|timestamp| {
                ES5.generate_document(
                    &crypto,
                    GenerateDocumentArgs {
                        keypair: &keypair,
                        share: &share,
                        path: "/same".to_string(),
                        text: "x".to_string(),
                        timestamp,
                        delete_after: None,
                    },
                )
                .unwrap()
            })
            .collect();
        docs.sort_by(cmp_newest_first);
        for pair in docs.windows(2) {
            // newest first: timestamps never increase down the list
            prop_assert!(pair[0].timestamp >= pair[1].timestamp);
            if pair[0].timestamp == pair[1].timestamp {
                prop_assert!(pair[0].signature >= pair[1].signature);
            }
        }
    }

    #[test]
    fn owned_path_rule(path in valid_path()) {
        let crypto = RustCrypto;
        let owner = AuthorKeypair::generate(&crypto, "ownr").unwrap();
        let other = AuthorKeypair::generate(&crypto, "othr").unwrap();
        let owned = format!("{path}/~{}", owner.address);
        prop_assert!(check_author_can_write_to_path(&owner.address, &owned).is_ok());
        prop_assert!(check_author_can_write_to_path(&other.address, &owned).is_err());
        prop_assert!(check_author_can_write_to_path(&other.address, &path).is_ok());
    }
}
