use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use std::path::Path;

use crate::error::Result;
use crate::persistence::write_json;
use crate::types::{ChatMessage, Conversation, Sender};

struct Template {
    titles: &'static [&'static str],
    turns: &'static [(Sender, &'static str)],
}

const TEMPLATES: &[Template] = &[
    Template {
        titles: &["WiFi drops after update", "Laptop network troubleshooting", "Fixing WiFi connection"],
        turns: &[
            (Sender::Human, "My laptop won't connect to WiFi after the latest system update. It worked yesterday."),
            (Sender::Assistant, "Let's troubleshoot step by step. Do you still see your network in the list of available networks?"),
            (Sender::Human, "Yes, but it says it can't connect to this network."),
            (Sender::Assistant, "Try disabling and re-enabling the adapter, then reset the TCP/IP stack and flush DNS before restarting."),
        ],
    },
    Template {
        titles: &["Homemade pasta tips", "First time making pasta", "Fresh pasta cooking time"],
        turns: &[
            (Sender::Human, "I'm making homemade pasta for the first time. Any tips?"),
            (Sender::Assistant, "Use two cups of flour and three eggs, knead for ten minutes and rest the dough for thirty minutes."),
            (Sender::Human, "How long should I cook fresh pasta?"),
            (Sender::Assistant, "Only two to four minutes. It floats when it is nearly done, so taste it early."),
        ],
    },
    Template {
        titles: &["Beginner workout plan", "Starting to exercise again", "Weight loss routine"],
        turns: &[
            (Sender::Human, "I haven't worked out in years. Where should I begin?"),
            (Sender::Assistant, "Start with short daily walks for two weeks, then add two days of bodyweight exercises."),
            (Sender::Human, "Mainly I want to lose weight and feel healthier."),
            (Sender::Assistant, "Combine three cardio sessions a week with simple strength work and small diet changes you can keep."),
        ],
    },
    Template {
        titles: &["Learning Spanish alone", "Spanish grammar help", "Self-study language plan"],
        turns: &[
            (Sender::Human, "I'm trying to learn Spanish on my own. What's the most effective approach?"),
            (Sender::Assistant, "Learn the thousand most common words with spaced repetition and practice thirty minutes a day."),
            (Sender::Human, "The grammar seems overwhelming."),
            (Sender::Assistant, "Focus on a handful of verbs in the present tense and learn phrase patterns instead of rules."),
        ],
    },
    Template {
        titles: &["Feeling stuck at work", "Career growth conversation", "Should I change jobs"],
        turns: &[
            (Sender::Human, "I've been at my job for five years and feel stuck. Should I leave or grow where I am?"),
            (Sender::Assistant, "Have you told your manager you want more responsibility? Many managers assume silence means contentment."),
            (Sender::Human, "I haven't really talked to them about it."),
            (Sender::Assistant, "Document your achievements, pick the skills you want to develop and schedule that conversation this month."),
        ],
    },
    Template {
        titles: &["Building an emergency fund", "Saving on a tight budget", "Paycheck to paycheck savings"],
        turns: &[
            (Sender::Human, "I live paycheck to paycheck. How do I start an emergency fund?"),
            (Sender::Assistant, "Automate a small weekly transfer right after payday and review your subscriptions for hidden money."),
            (Sender::Human, "What if an emergency happens before I've saved enough?"),
            (Sender::Assistant, "Even a small buffer helps. Join a credit union now and ask providers about payment plans."),
        ],
    },
    Template {
        titles: &["Rust borrow checker error", "Lifetimes in Rust", "Fixing a Rust compile error"],
        turns: &[
            (Sender::Human, "Why does the compiler say my value is borrowed after move?"),
            (Sender::Assistant, "The value was moved into the function call. Pass a reference instead, or clone it if you need ownership twice."),
            (Sender::Human, "And when do I need explicit lifetimes?"),
            (Sender::Assistant, "When a function returns a reference derived from more than one input and the compiler cannot infer which."),
        ],
    },
    Template {
        titles: &["Solo trip to Portugal", "Planning solo travel", "Hostel safety tips"],
        turns: &[
            (Sender::Human, "I have two weeks and a modest budget for my first solo trip. Where should I go?"),
            (Sender::Assistant, "Portugal is affordable, safe and easy to get around by train. Lisbon and Porto make a good pair."),
            (Sender::Human, "I'm nervous about staying in hostels alone."),
            (Sender::Assistant, "Book small hostels with strong reviews, pick female or small dorms and use the lockers they provide."),
        ],
    },
];

const FOLLOW_UPS: &[&str] = &[
    "Thanks, that's really helpful!",
    "Can you elaborate on that last point?",
    "What would you recommend I do first?",
    "That makes sense. I'll try that approach.",
];

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn pseudo_uuid(rng: &mut StdRng) -> String {
    let a: u32 = rng.gen();
    let b: u16 = rng.gen();
    let c: u16 = rng.gen::<u16>() & 0x0fff | 0x4000;
    let d: u16 = rng.gen::<u16>() & 0x3fff | 0x8000;
    let e: u64 = rng.gen::<u64>() & 0xffff_ffff_ffff;
    format!("{:08x}-{:04x}-{:04x}-{:04x}-{:012x}", a, b, c, d, e)
}

/// Synthetic chat export in the same shape as a real `conversations.json`.
/// Identical seeds give identical exports.
pub fn generate_export(count: usize, seed: Option<u64>) -> Vec<Conversation> {
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();

    let mut conversations = Vec::with_capacity(count);
    for _ in 0..count {
        let template = &TEMPLATES[rng.gen_range(0..TEMPLATES.len())];
        let name = template.titles.choose(&mut rng).copied().unwrap_or("Untitled");
        let start = epoch
            + Duration::days(rng.gen_range(0..365))
            + Duration::minutes(rng.gen_range(0..24 * 60));

        let length = rng.gen_range(2..=template.turns.len());
        let mut turns: Vec<(Sender, String)> = template.turns[..length]
            .iter()
            .map(|(sender, text)| (*sender, text.to_string()))
            .collect();

        if rng.gen_bool(0.3) && turns.last().map(|(s, _)| *s) == Some(Sender::Assistant) {
            let follow_up = FOLLOW_UPS.choose(&mut rng).copied().unwrap_or(FOLLOW_UPS[0]);
            turns.push((Sender::Human, follow_up.to_string()));
            turns.push((Sender::Assistant, "You're welcome! Ask if anything else comes up.".to_string()));
        }

        let mut at = start;
        let mut chat_messages = Vec::with_capacity(turns.len());
        for (sender, text) in turns {
            at += Duration::seconds(rng.gen_range(5..600));
            chat_messages.push(ChatMessage {
                sender,
                text,
                created_at: timestamp(at),
            });
        }

        conversations.push(Conversation {
            uuid: pseudo_uuid(&mut rng),
            name: name.to_string(),
            created_at: timestamp(start),
            updated_at: timestamp(at),
            chat_messages,
        });
    }

    conversations.shuffle(&mut rng);
    conversations
}

pub fn save_export(conversations: &[Conversation], path: impl AsRef<Path>) -> Result<()> {
    write_json(path.as_ref(), conversations)
}
