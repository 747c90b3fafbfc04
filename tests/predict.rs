//! End-to-end prediction behaviour of in-memory models.

mod common;

use common::{pet_classifier, TinyArgs, TinyModel, LABEL, WORD};
use fasttext_predict::dictionary::Dictionary;
use fasttext_predict::io::Reader;
use fasttext_predict::{Error, FastText};

fn load(bytes: &[u8]) -> FastText {
    FastText::load_model_from_reader(&mut Reader::new(bytes)).unwrap()
}

#[test]
fn softmax_prediction_matches_the_larger_dot_product() {
    let mut ft = load(&pet_classifier().to_bytes());
    let preds = ft.predict("cat dog", 2, 0.0).unwrap();
    assert_eq!(preds.len(), 2);

    // hidden = (row_cat + row_dog) / 2 scores +1 for label a, -1 for b
    assert_eq!(preds[0].label, "__label__a");
    assert_eq!(preds[1].label, "__label__b");
    assert!(preds[0].log_prob >= preds[1].log_prob);

    let expected_a = 1.0f32.exp() / (1.0f32.exp() + (-1.0f32).exp());
    assert!((preds[0].prob() - expected_a).abs() < 1e-2);

    let total: f32 = preds.iter().map(|p| p.prob()).sum();
    assert!((total - 1.0).abs() < 2e-2, "probabilities sum to {total}");
}

#[test]
fn predictions_are_deterministic() {
    let mut ft = load(&pet_classifier().to_bytes());
    let first = ft.predict("dog dog cat", 2, 0.0).unwrap();
    for _ in 0..5 {
        assert_eq!(ft.predict("dog dog cat", 2, 0.0).unwrap(), first);
    }
}

#[test]
fn unknown_text_has_no_predictions() {
    let mut ft = load(&pet_classifier().to_bytes());
    assert!(ft.predict("zebra lion", 2, 0.0).unwrap().is_empty());
    assert!(ft.predict("", 2, 0.0).unwrap().is_empty());
}

#[test]
fn threshold_and_k_bound_the_result_list() {
    let mut ft = load(&pet_classifier().to_bytes());
    let preds = ft.predict("cat dog", 1, 0.0).unwrap();
    assert_eq!(preds.len(), 1);

    let preds = ft.predict("cat dog", 2, 0.5).unwrap();
    assert_eq!(preds.len(), 1);
    assert!(preds[0].prob() >= 0.5);

    let all = ft.predict_all("cat dog", 0.0).unwrap();
    assert_eq!(all.len(), 2);

    let top = ft.predict_one("cat dog", 0.0).unwrap().unwrap();
    assert_eq!(top.label, "__label__a");
    assert!(ft.predict_one("cat dog", 0.99).unwrap().is_none());
}

fn hs_classifier() -> TinyModel {
    TinyModel {
        version: 12,
        args: TinyArgs {
            loss: 1, // hierarchical softmax
            ..TinyArgs::supervised_softmax(4)
        },
        entries: vec![
            ("cat".to_string(), 5, WORD),
            ("dog".to_string(), 7, WORD),
            ("__label__a".to_string(), 8, LABEL),
            ("__label__b".to_string(), 4, LABEL),
            ("__label__c".to_string(), 2, LABEL),
            ("__label__d".to_string(), 1, LABEL),
        ],
        n_words: 2,
        n_tokens: 27,
        input: (
            2,
            4,
            vec![
                0.5, 0.1, 0.0, 0.0, //
                0.1, 0.5, 0.0, 0.0, //
            ],
        ),
        // zero tree weights: every Huffman split is an exact coin flip
        output: (4, 4, vec![0.0; 16]),
    }
}

#[test]
fn hierarchical_softmax_probabilities_sum_to_one() {
    let mut ft = load(&hs_classifier().to_bytes());
    let preds = ft.predict("cat dog", 4, 0.0).unwrap();
    assert_eq!(preds.len(), 4);

    let total: f32 = preds.iter().map(|p| p.prob()).sum();
    assert!((total - 1.0).abs() < 1e-4, "probabilities sum to {total}");

    // counts 8,4,2,1 put label a one split from the root
    assert_eq!(preds[0].label, "__label__a");
    assert!((preds[0].prob() - 0.5).abs() < 1e-3);
    assert_eq!(preds[1].label, "__label__b");
}

#[test]
fn save_reproduces_the_loaded_bytes() {
    for model in [pet_classifier(), hs_classifier()] {
        let bytes = model.to_bytes();
        let ft = load(&bytes);
        let mut saved = Vec::new();
        ft.save_model_to_writer(&mut saved).unwrap();
        assert_eq!(saved, bytes);
    }
}

#[test]
fn version_eleven_supervised_models_load_without_subwords() {
    let mut model = pet_classifier();
    model.version = 11;
    model.args.minn = 3;
    model.args.maxn = 6;
    let ft = load(&model.to_bytes());
    assert_eq!(ft.version(), 11);
    assert_eq!(ft.args().maxn, 0);
    assert!(ft.args().use_max_vocabulary_size);
    // lookups still work against the 30M-slot probe table
    assert_eq!(ft.dictionary().id("dog").unwrap(), 1);
}

#[test]
fn bad_magic_and_versions_are_rejected() {
    let bytes = pet_classifier().to_bytes();

    let mut wrong_magic = bytes.clone();
    wrong_magic[0] ^= 0xFF;
    assert!(matches!(
        FastText::load_model_from_reader(&mut Reader::new(&wrong_magic[..])),
        Err(Error::InvalidModel(_))
    ));

    for version in [10i32, 13] {
        let mut wrong_version = bytes.clone();
        wrong_version[4..8].copy_from_slice(&version.to_le_bytes());
        assert!(matches!(
            FastText::load_model_from_reader(&mut Reader::new(&wrong_version[..])),
            Err(Error::InvalidModel(_))
        ));
    }
}

#[test]
fn truncated_model_is_rejected() {
    let bytes = pet_classifier().to_bytes();
    let cut = &bytes[..bytes.len() - 3];
    assert!(matches!(
        FastText::load_model_from_reader(&mut Reader::new(cut)),
        Err(Error::Truncated(_))
    ));
}

#[test]
fn text_vector_averages_input_rows() {
    let ft = load(&pet_classifier().to_bytes());
    let vec = ft.text_vector("cat dog").unwrap();
    assert_eq!(vec, vec![0.5, 0.5, 0.0, 0.0]);

    // unknown tokens contribute nothing
    let vec = ft.text_vector("cat zebra").unwrap();
    assert_eq!(vec, vec![1.0, 0.0, 0.0, 0.0]);
}

#[test]
fn sentence_vector_supervised_is_unnormalised_average() {
    let ft = load(&pet_classifier().to_bytes());
    let tokens = vec!["cat".to_string(), "dog".to_string()];
    assert_eq!(ft.sentence_vector(&tokens).unwrap(), vec![0.5, 0.5, 0.0, 0.0]);
}

#[test]
fn word_vector_of_known_and_unknown_words() {
    let ft = load(&pet_classifier().to_bytes());
    // maxn = 0: the vector is exactly the word's input row
    assert_eq!(ft.word_vector("cat").unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
    // out of vocabulary with no subwords: the zero vector
    assert_eq!(ft.word_vector("zebra").unwrap(), vec![0.0; 4]);
}

#[test]
fn token_and_text_predictions_agree() {
    let mut ft = load(&pet_classifier().to_bytes());
    let tokens = vec!["cat".to_string(), "dog".to_string()];
    let from_tokens = ft.predict_tokens(&tokens, 2, 0.0).unwrap();
    let from_text = ft.predict("cat dog", 2, 0.0).unwrap();
    assert_eq!(from_tokens, from_text);
}

#[test]
fn ngram_vectors_return_one_row_per_subword() {
    let ft = load(&pet_classifier().to_bytes());
    // maxn = 0: the only subword of an in-vocabulary word is itself,
    // and the rows are not averaged
    let vecs = ft.ngram_vectors("dog").unwrap();
    assert_eq!(vecs, vec![vec![0.0, 1.0, 0.0, 0.0]]);
    assert!(ft.ngram_vectors("zebra").unwrap().is_empty());
}

#[test]
fn batch_helpers_match_their_single_forms() {
    let ft = load(&pet_classifier().to_bytes());
    let words = vec!["cat".to_string(), "zebra".to_string()];
    assert_eq!(
        ft.word_vectors(&words).unwrap(),
        vec![
            ft.word_vector("cat").unwrap(),
            ft.word_vector("zebra").unwrap()
        ]
    );

    let texts = vec!["cat dog".to_string(), "dog".to_string()];
    assert_eq!(
        ft.text_vectors(&texts).unwrap(),
        vec![
            ft.text_vector("cat dog").unwrap(),
            ft.text_vector("dog").unwrap()
        ]
    );

    let sentences = vec![vec!["cat".to_string()], vec!["dog".to_string()]];
    assert_eq!(
        ft.sentence_vectors(&sentences).unwrap(),
        vec![
            ft.sentence_vector(&sentences[0]).unwrap(),
            ft.sentence_vector(&sentences[1]).unwrap()
        ]
    );
}
