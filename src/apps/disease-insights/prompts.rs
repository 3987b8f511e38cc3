// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::model::Disease;
use crate::store::ChatMessage;
use serde_json::{Map, Value};

// ============================================
// Assistant persona
// ============================================

const ASSISTANT_PERSONA: &str = r#"You are a professional, AI-powered **medical assistant chatbot** specializing in diseases related to the **heart, lungs, liver, parkinsons, and diabetes**. You are not a doctor, but you provide **medically accurate, empathetic, and easy-to-understand explanations**. You act as a supportive first step in a patient's health journey and always encourage consulting a licensed healthcare provider for diagnosis, treatment, or emergencies.

Your communication style should be:

* **Professional and caring**
* **Short, clear sentences**, like a helpful human would speak
* **Simple language**, avoiding complex jargon unless it's explained
* **Reassuring and non-alarming**, especially when discussing serious topics

When responding:

* Use a **natural, conversational tone**—you should sound like a real person who cares.
* Keep sentences **concise and human-like**, especially in follow-up answers.
* Provide helpful guidance on symptoms, risk factors, diagnosis, and general treatment options.
* Encourage users to seek professional care for medical decisions or emergencies.
* Never offer a direct diagnosis or prescribe treatments.
* If the user describes urgent symptoms (like chest pain or shortness of breath), **strongly recommend immediate medical attention.**

Include statements like:

* "I'm here to help explain things, but a doctor should confirm anything medical."
* "If you feel worse or unsure, it's safest to talk to a healthcare provider."
* "That sounds serious—please get medical help right away.""#;

pub const GREETING: &str = "Hello! I'm your health assistant. How can I help you today?";

/// Render a form value without JSON quoting for strings.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn form_lines<'a>(form: impl Iterator<Item = (&'a String, &'a Value)>) -> String {
    form.map(|(k, v)| format!("- {}: {}", k, plain(v)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt asking for causes, abnormal values, advice and foods.
pub fn recommendation_prompt(form: &Map<String, Value>, prediction: &str) -> String {
    let parameters = form_lines(form.iter().filter(|(k, _)| k.as_str() != "prediction"));
    format!(
        "The following health parameters were provided:\n{parameters}\n\n\
         The diagnosis is: {prediction}.\n\
         Based on the values given, if the person has the disease, explain the possible causes (with subheading). \n\
         If not, skip this section. Then, in the next subheading, highlight any abnormal (high/low) values and provide normal ranges. \n\
         Next, give proper health recommendations. Lastly, suggest appropriate foods that can help improve any abnormal values."
    )
}

/// Persona prompt carrying the form, results and conversation so far.
pub fn chat_prompt(
    disease: Disease,
    form: &Map<String, Value>,
    prediction: Option<&str>,
    recommendation: Option<&str>,
    messages: &[ChatMessage],
) -> String {
    let form_section = if form.is_empty() {
        "User has not provided any form data".to_string()
    } else {
        form_lines(form.iter())
    };

    let prediction_section = match prediction {
        Some(p) => format!("User has been tested for {disease} and the result is {p}"),
        None => format!(
            "user has not predicted anything for {disease}. Ask user to fill form data and hit get prediction button"
        ),
    };

    let recommendation_section = match recommendation {
        Some(r) => r.to_string(),
        None => format!(
            "user has not recommended anything for {disease}. Ask user to fill form data and hit get recommendation button"
        ),
    };

    let conversation = messages
        .iter()
        .map(|m| {
            if m.user {
                format!("User: {}", m.message)
            } else {
                format!("Assistant: {}", m.message)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"{ASSISTANT_PERSONA}

Current context:

- User has access to our disease prediction system
- Available predictions: diabetes, parkinsons, heart disease, lung disease and liver disease.
- User is currently consulting for {disease} related disease
- Our system provides recommendations based on AI analysis

Form Data:
{form_section}

Prediction:
{prediction_section}

Recommendation:
{recommendation_section}

Conversation History:

{conversation}

Use this context to generate a short, supportive, and medically-informed response.
"#
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recommendation_prompt_lists_parameters() {
        let form = json!({ "Glucose": "180", "BMI": 31.5, "prediction": "Positive" });
        let prompt = recommendation_prompt(form.as_object().unwrap(), "Positive");
        assert!(prompt.contains("- Glucose: 180\n- BMI: 31.5\n"));
        assert!(!prompt.contains("- prediction"));
        assert!(prompt.contains("The diagnosis is: Positive."));
    }

    #[test]
    fn test_chat_prompt_without_context() {
        let messages = vec![ChatMessage::assistant(GREETING), ChatMessage::user("Hi")];
        let prompt = chat_prompt(Disease::Liver, &Map::new(), None, None, &messages);
        assert!(prompt.contains("User has not provided any form data"));
        assert!(prompt.contains("user has not predicted anything for liver"));
        assert!(prompt.contains("hit get recommendation button"));
        assert!(prompt.contains(&format!("Assistant: {GREETING}\nUser: Hi")));
    }

    #[test]
    fn test_chat_prompt_persona_text() {
        let prompt = chat_prompt(Disease::Lung, &Map::new(), None, None, &[]);
        assert!(prompt.starts_with("You are a professional, AI-powered **medical assistant chatbot**"));
        assert!(prompt.contains(
            "* Use a **natural, conversational tone**\u{2014}you should sound like a real person who cares.\n"
        ));
        assert!(prompt.contains(
            "* \"That sounds serious\u{2014}please get medical help right away.\"\n\nCurrent context:"
        ));
    }

    #[test]
    fn test_chat_prompt_with_results() {
        let form = json!({ "Age": "61" });
        let prompt = chat_prompt(
            Disease::Heart,
            form.as_object().unwrap(),
            Some("Negative"),
            Some("Keep exercising."),
            &[ChatMessage::user("Is my heart ok?")],
        );
        assert!(prompt.contains("- Age: 61"));
        assert!(prompt.contains("tested for heart and the result is Negative"));
        assert!(prompt.contains("Recommendation:\nKeep exercising."));
        assert!(prompt.contains("consulting for heart related disease"));
    }
}
