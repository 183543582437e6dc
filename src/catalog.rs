//! Catalog of models shipped with the app. Reconciled into the `models`
//! table on every startup by `Database::sync_builtin_models`.

pub struct BuiltinModel {
    pub name: &'static str,
    pub weights_uri: &'static str,
    pub tokenizer_uri: &'static str,
    pub tokenizer_config_uri: &'static str,
    pub param_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub featured: bool,
    pub thinking: bool,
}

pub const BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        name: "Qwen3-0.6B",
        weights_uri: "https://huggingface.co/pocketllm/Qwen3-0.6B-pte/resolve/main/qwen3-0_6b.pte",
        tokenizer_uri: "https://huggingface.co/pocketllm/Qwen3-0.6B-pte/resolve/main/tokenizer.json",
        tokenizer_config_uri:
            "https://huggingface.co/pocketllm/Qwen3-0.6B-pte/resolve/main/tokenizer_config.json",
        param_count: Some(600_000_000),
        size_bytes: Some(1_254_000_000),
        featured: true,
        thinking: true,
    },
    BuiltinModel {
        name: "Llama-3.2-1B-Instruct",
        weights_uri:
            "https://huggingface.co/pocketllm/Llama-3.2-1B-pte/resolve/main/llama-3_2-1b.pte",
        tokenizer_uri:
            "https://huggingface.co/pocketllm/Llama-3.2-1B-pte/resolve/main/tokenizer.json",
        tokenizer_config_uri:
            "https://huggingface.co/pocketllm/Llama-3.2-1B-pte/resolve/main/tokenizer_config.json",
        param_count: Some(1_240_000_000),
        size_bytes: Some(2_470_000_000),
        featured: true,
        thinking: false,
    },
    BuiltinModel {
        name: "SmolLM2-1.7B-Instruct",
        weights_uri:
            "https://huggingface.co/pocketllm/SmolLM2-1.7B-pte/resolve/main/smollm2-1_7b.pte",
        tokenizer_uri:
            "https://huggingface.co/pocketllm/SmolLM2-1.7B-pte/resolve/main/tokenizer.json",
        tokenizer_config_uri:
            "https://huggingface.co/pocketllm/SmolLM2-1.7B-pte/resolve/main/tokenizer_config.json",
        param_count: Some(1_710_000_000),
        size_bytes: Some(3_420_000_000),
        featured: false,
        thinking: false,
    },
];
