use crate::{
    attributes::AttributesManager, bucketer::Bucketer, conditions::ConditionsChecker,
    datafile_reader::DatafileReader, effects::EffectsManager, modules::ModulesManager,
    source::SourceResolver, transformer::Transformer, validator::Validator,
};

/// Everything needed to evaluate datafile rules against one datafile revision.
///
/// The reader is captured once per operation, so a concurrent datafile swap never affects an
/// operation that is already running.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    reader: &'a DatafileReader,
    modules: &'a ModulesManager,
    attributes: &'a AttributesManager,
    effects: &'a EffectsManager,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        reader: &'a DatafileReader,
        modules: &'a ModulesManager,
        attributes: &'a AttributesManager,
        effects: &'a EffectsManager,
    ) -> Evaluator<'a> {
        Evaluator {
            reader,
            modules,
            attributes,
            effects,
        }
    }

    pub fn reader(&self) -> &'a DatafileReader {
        self.reader
    }

    pub fn modules(&self) -> &'a ModulesManager {
        self.modules
    }

    pub fn source_resolver(&self) -> SourceResolver<'a> {
        SourceResolver::new(self.modules, self.attributes, self.effects)
    }

    pub fn conditions_checker(&self) -> ConditionsChecker<'a> {
        ConditionsChecker::new(self.reader, self.source_resolver())
    }

    pub fn transformer(&self) -> Transformer<'a> {
        Transformer::new(self.conditions_checker(), self.source_resolver())
    }

    pub fn bucketer(&self) -> Bucketer<'a> {
        Bucketer::new(self.conditions_checker(), self.source_resolver())
    }

    pub fn validator(&self) -> Validator<'a> {
        Validator::new(self.reader)
    }
}
