//! The built-in restaurant reservation flow.
//!
//! Used by the demo session endpoint and throughout the test suite.

use super::FlowConfig;
use serde_json::json;

pub const DEMO_FLOW_NAME: &str = "restaurant-reservation";

/// Build the reservation flow: greet, collect a party size (large parties
/// transfer to a manager), collect a date/time, check availability, collect
/// contact details, create the booking, say goodbye.
pub fn reservation_flow() -> FlowConfig {
    serde_json::from_value(json!({
        "meta": {"name": DEMO_FLOW_NAME, "locale": "en-US"},
        "start": "InitialGreeting",
        "intents": {
            "BOOK": {
                "examples": [
                    "i'd like to make a reservation",
                    "book a table",
                    "i want a table"
                ]
            },
            "ASK_QUESTION": {
                "examples": [
                    "what are your opening hours",
                    "where are you located",
                    "do you have vegan options"
                ]
            },
            "PROVIDE_PARTY_SIZE": {
                "examples": ["we are 4 people", "party of 6", "just 2 of us"],
                "slots": {"count": "number"}
            },
            "PROVIDE_DATETIME": {
                "examples": [
                    "tomorrow at 7pm",
                    "friday at 6:30 pm",
                    "2025-01-20 at 19:00"
                ],
                "slots": {"date": "date", "time": "time"}
            },
            "PROVIDE_CONTACT": {
                "examples": [
                    "my name is john doe",
                    "phone 555 1234",
                    "reach me at 555-1234"
                ],
                "slots": {"name": "name", "phone": "phone"}
            }
        },
        "tools": {
            "CheckAvailability": {
                "args": {"date": "string", "time": "string", "partySize": "number"},
                "result": {"ok": "boolean"},
                "timeout_ms": 10_000
            },
            "CreateReservation": {
                "args": {
                    "date": "string",
                    "time": "string",
                    "partySize": "number",
                    "contact": "object"
                },
                "result": {"reservationId": "string"},
                "timeout_ms": 10_000
            }
        },
        "states": {
            "InitialGreeting": {
                "onEnter": [
                    {"ask": "Hi! Thanks for calling The Rusty Skillet. How can I help you today?"}
                ],
                "transitions": [
                    {"onIntent": "BOOK", "to": "CollectPartySize"}
                ]
            },
            "CollectPartySize": {
                "onEnter": [{"ask": "How many people will be joining us?"}],
                "transitions": [
                    {
                        "onIntent": "PROVIDE_PARTY_SIZE",
                        "assign": {"partySize": "{{slot.count}}"},
                        "branch": [
                            {"when": "{{ctx.partySize}} > 8", "to": "TransferToManager"},
                            {"when": "else", "to": "CollectReservationDateTime"}
                        ]
                    }
                ]
            },
            "TransferToManager": {
                "onEnter": [
                    {"say": "For parties larger than eight our manager will take care of you. One moment."},
                    {"transfer": "+15551234567"}
                ]
            },
            "CollectReservationDateTime": {
                "onEnter": [{"ask": "What date and time would you like?"}],
                "transitions": [
                    {
                        "onIntent": "PROVIDE_DATETIME",
                        "assign": {"date": "{{slot.date}}", "time": "{{slot.time}}"},
                        "to": "ConfirmAvailability"
                    }
                ]
            },
            "ConfirmAvailability": {
                "onEnter": [
                    {"say": "One moment while I check availability."},
                    {
                        "tool": "CheckAvailability",
                        "args": {
                            "date": "{{ctx.date}}",
                            "time": "{{ctx.time}}",
                            "partySize": "{{ctx.partySize}}"
                        }
                    }
                ],
                "transitions": [
                    {
                        "onToolResult": "CheckAvailability",
                        "when": "{{tool.ok}} == true",
                        "to": "CollectContactInformation"
                    },
                    {"onToolResult": "CheckAvailability", "to": "AltDateTime"}
                ]
            },
            "AltDateTime": {
                "onEnter": [
                    {"ask": "I'm sorry, that time isn't available. Is there another date and time that works?"}
                ],
                "transitions": [
                    {
                        "onIntent": "PROVIDE_DATETIME",
                        "assign": {"date": "{{slot.date}}", "time": "{{slot.time}}"},
                        "to": "ConfirmAvailability"
                    }
                ]
            },
            "CollectContactInformation": {
                "onEnter": [
                    {"ask": "Great, that time is open! Can I get a name and phone number for the reservation?"}
                ],
                "transitions": [
                    {
                        "onIntent": "PROVIDE_CONTACT",
                        "assign": {
                            "contact.name": "{{slot.name}}",
                            "contact.phone": "{{slot.phone}}"
                        },
                        "to": "CreateBooking"
                    }
                ]
            },
            "CreateBooking": {
                "onEnter": [
                    {
                        "tool": "CreateReservation",
                        "args": {
                            "date": "{{ctx.date}}",
                            "time": "{{ctx.time}}",
                            "partySize": "{{ctx.partySize}}",
                            "contact": {
                                "name": "{{ctx.contact.name}}",
                                "phone": "{{ctx.contact.phone}}"
                            }
                        }
                    }
                ],
                "transitions": [
                    {
                        "onToolResult": "CreateReservation",
                        "assign": {"reservationId": "{{tool.reservationId}}"},
                        "to": "Goodbye"
                    }
                ]
            },
            "Goodbye": {
                "onEnter": [
                    {"say": "You're all set for {{ctx.date}} at {{ctx.time}}, party of {{ctx.partySize}}. Your confirmation number is {{ctx.reservationId}}. See you soon!"},
                    {"hangup": true}
                ]
            }
        }
    }))
    .expect("demo flow is well-formed")
}
