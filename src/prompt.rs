use crate::models::{Category, Item};
use once_cell::sync::Lazy;
use std::collections::HashSet;

pub const HTML_BUDGET_CHARS: usize = 6000;
pub const MAX_BATCH_TITLES: usize = 3;
pub const NOT_FOUND: &str = "not found";

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "and", "the", "for", "with", "from", "into", "your", "you", "our", "this", "that",
        "are", "all", "any", "not", "but", "has", "have", "its", "per", "set", "pack", "new",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    max_categories: Option<usize>,
}

impl PromptBuilder {
    pub fn new(max_categories: Option<usize>) -> Self {
        Self { max_categories }
    }

    pub fn build_classification_prompt(&self, item: &Item, categories: &[Category]) -> String {
        let selected = self.select_categories(item, categories);
        let mut cat_list = String::new();
        for category in selected {
            let description = category.description.trim();
            if description.is_empty() {
                cat_list.push_str(&format!("- {}\n", category.name.trim()));
            } else {
                cat_list.push_str(&format!("- {}: {}\n", category.name.trim(), description));
            }
        }

        let mut prompt = String::from(
            "Given the following product title and description, select the most relevant category from the list.\n",
        );
        prompt.push_str(&format!("Product Title: {}\n", item.title.trim()));
        prompt.push_str(&format!("Product Description: {}\n", item.description.trim()));
        prompt.push_str(&format!("Categories:\n{cat_list}"));
        prompt.push_str(
            "\nRespond only with the category name exactly as listed, on a single line, without quotes or punctuation.",
        );
        prompt
    }

    /// Applies the category bound. Vocabularies within the bound come back untouched;
    /// larger ones are narrowed to the entries sharing the most words with the item,
    /// still in their input order.
    pub fn select_categories<'a>(&self, item: &Item, categories: &'a [Category]) -> Vec<&'a Category> {
        let limit = match self.max_categories {
            Some(limit) if categories.len() > limit => limit,
            _ => return categories.iter().collect(),
        };

        let item_words = words(&format!("{} {}", item.title, item.description));
        let mut ranked: Vec<(usize, usize)> = categories
            .iter()
            .enumerate()
            .map(|(idx, category)| {
                let name_hits = words(&category.name)
                    .iter()
                    .filter(|w| item_words.contains(*w))
                    .count();
                let description_hits = words(&category.description)
                    .iter()
                    .filter(|w| item_words.contains(*w))
                    .count();
                (idx, name_hits * 2 + description_hits)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked.sort_by_key(|(idx, _)| *idx);
        ranked.into_iter().map(|(idx, _)| &categories[idx]).collect()
    }
}

pub fn build_batch_extraction_prompt(
    titles: &[String],
    html_body: &str,
    instructions: Option<&str>,
) -> String {
    let titles = &titles[..titles.len().min(MAX_BATCH_TITLES)];
    let mut prompt = String::from(
        "Given the following HTML and a list of product titles, for each product, determine if it is present on the site and, if so, what is its category. If the main page does not contain categories, use any sitemap, breadcrumb or category listing visible in the HTML.\n",
    );
    prompt.push_str(&format!(
        "Respond in JSON: {{\"Product Title 1\":\"Category\",\"Product Title 2\":\"{NOT_FOUND}\"}}.\n"
    ));
    if let Some(extra) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("Instructions for searching categories: {extra}\n"));
    }
    let keys = serde_json::to_string(titles).unwrap_or_else(|_| titles.join("; "));
    prompt.push_str(&format!("Product Titles: {keys}\n"));
    prompt.push_str("HTML:\n");
    prompt.push_str(truncate_chars(html_body, HTML_BUDGET_CHARS));
    prompt.push_str(&format!(
        "\nRespond only with one flat JSON object using each product title exactly as a key and a category name or \"{NOT_FOUND}\" as the value."
    ));
    prompt
}

pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &input[..byte_idx],
        None => input,
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(w.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, description: &str) -> Item {
        Item {
            id: 1,
            title: title.into(),
            description: description.into(),
            category_ids: Default::default(),
        }
    }

    #[test]
    fn classification_prompt_lists_every_category() {
        let categories = vec![
            Category::new(1, "Garden Tools", "Shovels, rakes and hoes"),
            Category::new(2, "Shoes", ""),
        ];
        let prompt = PromptBuilder::new(Some(250))
            .build_classification_prompt(&item("Steel rake", "Wide head"), &categories);
        assert!(prompt.contains("Product Title: Steel rake\n"));
        assert!(prompt.contains("Product Description: Wide head\n"));
        assert!(prompt.contains("- Garden Tools: Shovels, rakes and hoes\n"));
        assert!(prompt.contains("- Shoes\n"));
        assert!(prompt.ends_with("without quotes or punctuation."));
    }

    #[test]
    fn oversized_vocabulary_is_prefiltered_in_input_order() {
        let categories = vec![
            Category::new(1, "Shoes", "Sneakers and boots"),
            Category::new(2, "Garden Tools", "Rakes"),
            Category::new(3, "Kitchen", "Pots and pans"),
            Category::new(4, "Garden Furniture", "Outdoor chairs"),
        ];
        let builder = PromptBuilder::new(Some(2));
        let selected = builder.select_categories(
            &item("Garden rake", "Steel garden rake for leaves"),
            &categories,
        );
        let ids: Vec<u64> = selected.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 4]);

        let prompt = builder.build_classification_prompt(&item("Garden rake", ""), &categories);
        assert!(!prompt.contains("- Kitchen"));
    }

    #[test]
    fn unbounded_builder_keeps_everything() {
        let categories: Vec<Category> = (1..=400)
            .map(|id| Category::new(id, &format!("Category {id}"), ""))
            .collect();
        let selected = PromptBuilder::new(None).select_categories(&item("x", ""), &categories);
        assert_eq!(selected.len(), 400);
    }

    #[test]
    fn batch_prompt_truncates_html_and_caps_titles() {
        let html = "é".repeat(HTML_BUDGET_CHARS + 500);
        let titles: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        let prompt = build_batch_extraction_prompt(&titles, &html, Some("  look at breadcrumbs "));
        assert_eq!(prompt.matches('é').count(), HTML_BUDGET_CHARS);
        assert!(prompt.contains(r#"Product Titles: ["A","B","C"]"#));
        assert!(!prompt.contains("\"D\""));
        assert!(prompt.contains("Instructions for searching categories: look at breadcrumbs\n"));
    }

    #[test]
    fn batch_prompt_omits_blank_instructions() {
        let titles = vec!["Lamp".to_string()];
        let prompt = build_batch_extraction_prompt(&titles, "<html></html>", Some("   "));
        assert!(!prompt.contains("Instructions for searching"));
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
