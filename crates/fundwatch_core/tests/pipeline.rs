use chrono::NaiveDate;
use fundwatch_core::extract::{ExtractSource, FilingDocuments, TickerSource, extract_filing};
use fundwatch_core::history::{NameSource, find_series_by_name, history};
use fundwatch_core::rollup::{Lifecycle, Selection, rollup};
use fundwatch_core::store::Store;
use fundwatch_core::submissions::{FilingRef, primary_document_url, submission_text_url};
use tempfile::tempdir;

const REGISTRANT: &str = "2000001";

fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
}

fn filing(accession: &str, form: &str, filed: &str, document: &str) -> FilingRef {
    FilingRef {
        registrant_id: REGISTRANT.to_string(),
        registrant_name: "Example Crypto Trust".to_string(),
        accession: accession.to_string(),
        form: form.to_string(),
        filing_date: date(filed),
        primary_document: document.to_string(),
        primary_url: primary_document_url(REGISTRANT, accession, document),
        submission_text_url: submission_text_url(REGISTRANT, accession),
    }
}

fn tagged_submission(form: &str, extra_header: &str, class_name: &str, ticker: &str, body: &str) -> String {
    format!(
        "<SEC-HEADER>\nCONFORMED SUBMISSION TYPE:\t{form}\n{extra_header}\
SERIES AND CLASSES CONTRACTS DATA:\n\tEXISTING SERIES AND CLASSES CONTRACTS:\n\
\t\tSERIES:\n\t\t\tSERIES ID:\tS000090001\n\t\t\tSERIES NAME:\tAlpha Bitcoin Fund\n\
\t\t\tCLASS-CONTRACT:\n\t\t\t\tCLASS-CONTRACT ID:\tC000290001\n\
\t\t\t\tCLASS-CONTRACT NAME:\t{class_name}\n\
\t\t\t\tCLASS-CONTRACT TICKER SYMBOL:\t{ticker}\n\
</SEC-HEADER>\n<DOCUMENT>\n<TYPE>{form}\n<SEQUENCE>1\n<FILENAME>prospectus.htm\n<TEXT>\n{body}\n</TEXT>\n</DOCUMENT>\n"
    )
}

#[test]
fn filings_flow_through_store_into_rollup_and_history() {
    let initial = filing("0002000001-24-000001", "485APOS", "2024-01-10", "apos.htm");
    let initial_text = tagged_submission(
        "485APOS",
        "",
        "Alpha Bitcoin Fund",
        "",
        "<html><body><p>Alpha Bitcoin Fund (ALPB) seeks exposure to bitcoin.</p>\
<p>This registration statement will become effective on March 25, 2024.</p></body></html>",
    );
    let initial_rows = extract_filing(
        &initial,
        &FilingDocuments {
            submission_text: Some(&initial_text),
            ..FilingDocuments::default()
        },
    );
    assert_eq!(initial_rows.strategy, Some(ExtractSource::TaggedText));
    assert_eq!(initial_rows.effective_date, Some(date("2024-03-25")));
    assert_eq!(initial_rows.rows.len(), 1);
    assert_eq!(initial_rows.rows[0].ticker.as_deref(), Some("ALPB"));
    assert_eq!(
        initial_rows.rows[0].provenance.ticker,
        Some(TickerSource::TitleParen)
    );

    let amendment = filing("0002000001-24-000007", "485BPOS", "2024-08-01", "bpos.htm");
    let amendment_text = tagged_submission(
        "485BPOS",
        "EFFECTIVENESS DATE:\t20240805\n",
        "Beta Bitcoin Fund",
        "BETB",
        "<html><body><table>\
<tr><th>Fund Name</th><th>Ticker</th></tr>\
<tr><td>Beta Bitcoin Fund ETF Shares</td><td>BETB</td></tr>\
</table></body></html>",
    );
    let amendment_rows = extract_filing(
        &amendment,
        &FilingDocuments {
            submission_text: Some(&amendment_text),
            ..FilingDocuments::default()
        },
    );
    assert_eq!(amendment_rows.rows.len(), 1);
    assert_eq!(
        amendment_rows.rows[0].prospectus_name.as_deref(),
        Some("Beta Bitcoin Fund ETF Shares")
    );

    let supplement = filing("0002000001-24-000011", "497", "2024-09-01", "sup.htm");
    let supplement_text = "<SEC-HEADER>\nCONFORMED SUBMISSION TYPE:\t497\n</SEC-HEADER>\n";
    let supplement_html = "<html><body><table>\
<tr><td>Fund</td><td>Ticker</td></tr>\
<tr><td>Gamma Ether Fund</td><td>geth</td></tr>\
</table></body></html>";
    let supplement_rows = extract_filing(
        &supplement,
        &FilingDocuments {
            submission_text: Some(supplement_text),
            primary_html: Some(supplement_html),
            primary_pdf_text: None,
        },
    );
    assert_eq!(supplement_rows.strategy, Some(ExtractSource::HtmlTable));

    let notice = filing("0002000001-24-000012", "EFFECT", "2024-09-02", "primary_doc.xml");
    assert!(
        extract_filing(
            &notice,
            &FilingDocuments {
                submission_text: Some(&amendment_text),
                ..FilingDocuments::default()
            }
        )
        .rows
        .is_empty()
    );

    let temp = tempdir().expect("tempdir");
    let mut store = Store::open(&temp.path().join("fundwatch.db")).expect("open store");
    for extraction in [&initial_rows, &amendment_rows, &supplement_rows] {
        store
            .upsert_rows(REGISTRANT, &extraction.rows)
            .expect("upsert");
    }
    store
        .upsert_rows(REGISTRANT, &initial_rows.rows)
        .expect("re-upsert");
    assert_eq!(store.row_count(REGISTRANT).expect("count"), 3);

    let rows = store.load_rows(REGISTRANT).expect("load");
    let statuses = rollup(&rows);
    assert_eq!(statuses.len(), 2);

    let beta = &statuses[0];
    assert_eq!(beta.fund_key, "C:C000290001");
    assert_eq!(beta.canonical_name, "Beta Bitcoin Fund");
    assert_eq!(beta.ticker.as_deref(), Some("BETB"));
    assert_eq!(beta.selection, Selection::PostEffective);
    assert_eq!(beta.lifecycle, Lifecycle::Effective);
    assert_eq!(beta.first_seen_date, date("2024-01-10"));
    assert_eq!(beta.first_seen_form, "485APOS");
    let chosen = beta.latest_prospectus.as_ref().expect("chosen prospectus");
    assert_eq!(chosen.effective_date, date("2024-08-05"));
    assert_eq!(
        beta.latest_initial
            .as_ref()
            .map(|initial| initial.accession.as_str()),
        Some("0002000001-24-000001")
    );

    let gamma = &statuses[1];
    assert_eq!(gamma.fund_key, "gamma ether fund|T:GETH");
    assert_eq!(gamma.selection, Selection::SupplementsOnly);
    assert!(gamma.latest_prospectus.is_none());

    let names = history(&rows);
    assert_eq!(names.len(), 3);
    let current = names
        .iter()
        .filter(|entry| entry.is_current)
        .collect::<Vec<_>>();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].name, "Beta Bitcoin Fund");
    assert_eq!(current[0].source, NameSource::Sgml);
    let alpha = names
        .iter()
        .find(|entry| entry.name == "Alpha Bitcoin Fund")
        .expect("alpha entry");
    assert_eq!(alpha.last_seen, Some(date("2024-01-10")));
    assert!(
        names
            .iter()
            .any(|entry| entry.source == NameSource::Prospectus)
    );

    let matches = find_series_by_name(&names, "alpha bitcoin");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].series_id, "S000090001");
    assert_eq!(matches[0].current_name, "Beta Bitcoin Fund");
    assert_eq!(matches[0].all_names.len(), 3);
}
