//! Conversion to the memory-mapped layout and parity between the two
//! model forms.

mod common;

use common::{TinyArgs, TinyModel, LABEL, WORD};
use fasttext_predict::dictionary::Dictionary;
use fasttext_predict::io::Reader;
use fasttext_predict::{Error, FastText, Rng};

/// Supervised classifier with subwords and word bigrams, so conversion
/// covers the n-gram id space too.
fn subword_classifier() -> TinyModel {
    let words = [
        "cat", "dog", "mouse", "horse", "sheep", "cow", "hen", "goat", "pig", "duck",
    ];
    let mut entries: Vec<(String, i64, u8)> = words
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), 3 + i as i64, WORD))
        .collect();
    entries.push(("__label__farm".to_string(), 11, LABEL));
    entries.push(("__label__pet".to_string(), 9, LABEL));
    let n_words = words.len();
    let n_tokens: i64 = entries.iter().map(|e| e.1).sum();

    let args = TinyArgs {
        word_ngrams: 2,
        minn: 2,
        maxn: 4,
        bucket: 64,
        ..TinyArgs::supervised_softmax(6)
    };

    let mut rng = Rng(42);
    let input_rows = n_words + args.bucket as usize;
    let input: Vec<f32> = (0..input_rows * 6).map(|_| rng.rand_real() - 0.5).collect();
    let output: Vec<f32> = (0..2 * 6).map(|_| rng.rand_real() - 0.5).collect();

    TinyModel {
        version: 12,
        args,
        entries,
        n_words,
        n_tokens,
        input: (input_rows, 6, input),
        output: (2, 6, output),
    }
}

fn random_word(rng: &mut Rng) -> String {
    let len = 2 + (rng.rand_u64() % 7) as usize;
    (0..len)
        .map(|_| char::from(b'a' + (rng.rand_u64() % 26) as u8))
        .collect()
}

#[test]
fn converted_model_answers_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = subword_classifier().to_bytes();
    let mut native = FastText::load_model_from_reader(&mut Reader::new(&bytes[..])).unwrap();
    native.save_as_memory_mapped_model(dir.path()).unwrap();

    let mut mapped = FastText::load_model(dir.path()).unwrap();
    assert!(mapped.is_memory_mapped());

    let native_dict = native.dictionary();
    let mapped_dict = mapped.dictionary();
    assert_eq!(mapped_dict.size(), native_dict.size());
    assert_eq!(mapped_dict.n_words(), native_dict.n_words());
    assert_eq!(mapped_dict.n_labels(), native_dict.n_labels());

    // every vocabulary entry and a large sample of random words resolve
    // to the same ids through the sorted-array lookup
    for id in 0..native_dict.size() {
        let word = native_dict.entry_word(id).unwrap();
        assert_eq!(mapped_dict.id(&word).unwrap(), id as i32);
    }
    let mut rng = Rng(7);
    for _ in 0..1000 {
        let word = random_word(&mut rng);
        assert_eq!(
            mapped_dict.id(&word).unwrap(),
            native_dict.id(&word).unwrap(),
            "{word}"
        );
        assert_eq!(
            mapped_dict.subwords(&word).unwrap(),
            native_dict.subwords(&word).unwrap(),
            "{word}"
        );
    }

    // whole entries come back identical through the record reader
    let native_entries = native_dict.entries().unwrap();
    let mapped_entries = mapped_dict.entries().unwrap();
    for (a, b) in native_entries.iter().zip(&mapped_entries) {
        assert_eq!(a.word, b.word);
        assert_eq!(a.count, b.count);
        assert_eq!(a.entry_type, b.entry_type);
        assert_eq!(a.subwords, b.subwords);
    }

    // vectors and predictions agree bit for bit
    for word in ["cat", "sheep", "unseen"] {
        assert_eq!(
            mapped.word_vector(word).unwrap(),
            native.word_vector(word).unwrap()
        );
    }
    for text in ["cat dog", "horse duck hen", "pig", "unseen words only"] {
        assert_eq!(
            mapped.predict(text, 2, 0.0).unwrap(),
            native.predict(text, 2, 0.0).unwrap(),
            "{text}"
        );
    }
}

#[test]
fn save_model_writes_a_loadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = subword_classifier().to_bytes();
    let ft = FastText::load_model_from_reader(&mut Reader::new(&bytes[..])).unwrap();

    let path = ft.save_model(dir.path().join("animals")).unwrap();
    assert!(path.ends_with("animals.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), bytes);

    let reloaded = FastText::load_model(&path).unwrap();
    assert_eq!(reloaded.dictionary().size(), ft.dictionary().size());
}

#[test]
fn mapped_handles_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = subword_classifier().to_bytes();
    let native = FastText::load_model_from_reader(&mut Reader::new(&bytes[..])).unwrap();
    native.save_as_memory_mapped_model(dir.path()).unwrap();

    let mapped = FastText::load_model(dir.path()).unwrap();
    assert!(matches!(
        mapped.save_model(dir.path().join("copy")),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        mapped.save_as_memory_mapped_model(dir.path().join("again")),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn clones_answer_independently_and_identically() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = subword_classifier().to_bytes();
    let native = FastText::load_model_from_reader(&mut Reader::new(&bytes[..])).unwrap();
    native.save_as_memory_mapped_model(dir.path()).unwrap();

    let mut original = FastText::load_model(dir.path()).unwrap();
    let mut clone = original.clone_handle();

    // interleaved cursor use on both handles stays consistent
    let o_dict = original.dictionary();
    let c_dict = clone.dictionary();
    for id in 0..o_dict.size() {
        let from_original = o_dict.entry_word(id).unwrap();
        let from_clone = c_dict.entry_word(o_dict.size() - 1 - id).unwrap();
        assert_eq!(from_original, o_dict.entry_word(id).unwrap());
        assert_eq!(
            from_clone,
            c_dict.entry_word(o_dict.size() - 1 - id).unwrap()
        );
    }

    let a = original.predict("cat dog", 2, 0.0).unwrap();
    let b = clone.predict("cat dog", 2, 0.0).unwrap();
    assert_eq!(a, b);
}

#[test]
fn closing_the_original_invalidates_clones() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = subword_classifier().to_bytes();
    let native = FastText::load_model_from_reader(&mut Reader::new(&bytes[..])).unwrap();
    native.save_as_memory_mapped_model(dir.path()).unwrap();

    let mut original = FastText::load_model(dir.path()).unwrap();
    let mut clone = original.clone_handle();
    assert!(!original.predict("cat dog", 1, 0.0).unwrap().is_empty());

    original.close().unwrap();
    assert!(matches!(
        clone.predict("cat dog", 1, 0.0),
        Err(Error::AlreadyClosed(_))
    ));
}

fn toy_embeddings() -> TinyModel {
    TinyModel {
        version: 12,
        args: TinyArgs::skipgram_softmax(2),
        entries: vec![
            ("cat".to_string(), 10, WORD),
            ("dog".to_string(), 8, WORD),
            ("fish".to_string(), 5, WORD),
            ("bird".to_string(), 3, WORD),
        ],
        n_words: 4,
        n_tokens: 26,
        input: (
            4,
            2,
            vec![
                1.0, 0.0, // cat
                0.9, 0.2, // dog
                -1.0, 0.1, // fish
                0.0, 1.0, // bird
            ],
        ),
        output: (4, 2, vec![0.0; 8]),
    }
}

#[test]
fn nearest_neighbors_rank_by_cosine_and_ban_the_query() {
    let ft = FastText::load_model_from_reader(&mut Reader::new(&toy_embeddings().to_bytes()[..]))
        .unwrap();

    let neighbors = ft.nn("cat", 2).unwrap();
    assert_eq!(neighbors.len(), 2);
    assert_eq!(neighbors[0].word, "dog");
    assert!(neighbors.iter().all(|n| n.word != "cat"));
    assert!(neighbors[0].similarity >= neighbors[1].similarity);
    assert!((neighbors[0].similarity - 0.9761871).abs() < 1e-4);

    // k larger than the vocabulary just returns everything else
    let neighbors = ft.nn("cat", 10).unwrap();
    assert_eq!(neighbors.len(), 3);
}

#[test]
fn analogies_score_the_combined_query_vector() {
    let ft = FastText::load_model_from_reader(&mut Reader::new(&toy_embeddings().to_bytes()[..]))
        .unwrap();

    // cat - cat + bird: the query reduces to bird's direction
    let result = ft.analogies("cat", "cat", "bird", 1).unwrap();
    assert_eq!(result[0].word, "dog");

    // three of the four words are banned, so only one candidate remains
    let result = ft.analogies("cat", "dog", "fish", 2).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].word, "bird");
}

#[test]
fn clones_share_the_precomputed_word_vectors() {
    let ft = FastText::load_model_from_reader(&mut Reader::new(&toy_embeddings().to_bytes()[..]))
        .unwrap();
    let clone = ft.clone_handle();

    let from_original = ft.nn("dog", 3).unwrap();
    let from_clone = clone.nn("dog", 3).unwrap();
    assert_eq!(from_original, from_clone);
}

#[test]
fn unsupervised_sentence_vector_averages_unit_vectors() {
    let ft = FastText::load_model_from_reader(&mut Reader::new(&toy_embeddings().to_bytes()[..]))
        .unwrap();
    let tokens = vec!["cat".to_string(), "bird".to_string(), "unseen".to_string()];
    let svec = ft.sentence_vector(&tokens).unwrap();
    // cat normalises to (1,0), bird to (0,1); the unknown token has zero
    // norm and is skipped
    assert!((svec[0] - 0.5).abs() < 1e-6);
    assert!((svec[1] - 0.5).abs() < 1e-6);
}
