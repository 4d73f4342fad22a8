//! 抽出フィールド定義
//!
//! 抽出結果の形は設定から宣言的に決まる。収束エンジン本体は
//! 位置・信頼度・フェイス数しか見ず、残りは属性バッグとして素通しする。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Currency,
    Boolean,
}

impl FieldKind {
    fn json_type(&self) -> &'static str {
        match self {
            FieldKind::Text => "string",
            FieldKind::Number | FieldKind::Currency => "number",
            FieldKind::Boolean => "boolean",
        }
    }
}

/// 1属性の定義
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// 棚商品の標準フィールド
pub fn default_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new("name", FieldKind::Text, "product name as printed on the pack").required(),
        FieldDescriptor::new("brand", FieldKind::Text, "brand or manufacturer"),
        FieldDescriptor::new("price", FieldKind::Currency, "shelf-edge price"),
        FieldDescriptor::new("size", FieldKind::Text, "pack size or volume, e.g. 500ml"),
    ]
}

/// プロンプトに埋め込む出力スキーマ例
pub fn schema_example(fields: &[FieldDescriptor]) -> String {
    let mut lines = vec![
        "    \"shelf\": <shelf number, 1 = top>".to_string(),
        "    \"slot\": <slot number, 1 = leftmost>".to_string(),
        "    \"facings\": <number of facing units>".to_string(),
        "    \"confidence\": <0.0-1.0>".to_string(),
    ];
    lines.extend(fields.iter().map(|f| {
        format!(
            "    \"{}\": <{}{}{}>",
            f.name,
            f.kind.json_type(),
            if f.description.is_empty() { "" } else { ", " },
            f.description
        )
    }));
    format!("[\n  {{\n{}\n  }}\n]", lines.join(",\n"))
}
